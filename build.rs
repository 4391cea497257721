fn main() {
    uniffi::generate_scaffolding("src/sensorlink.udl").expect("failed to generate uniffi scaffolding");
}
