//! Runtime permission negotiation.
//!
//! The platform reports its API level as a string and shows the grant
//! dialogs; this module decides which grants are needed and reduces the
//! per-permission outcomes to a single [`PermissionResult`].

use std::sync::Arc;

use nom::{
    bytes::complete::take_till,
    character::complete::digit1,
    combinator::map_res,
    sequence::preceded,
    IResult, Parser,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{DenialReason, PermissionResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    CoarseLocation,
    FineLocation,
    BluetoothScan,
    BluetoothConnect,
}

/// Outcome of a single permission request as reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// Denied and the platform will no longer prompt for it.
    NeverAskAgain,
    /// The platform does not know this permission.
    Unavailable,
}

/// Host-side permission bridge. Calls may block while a dialog is shown.
pub trait PermissionPlatform: Send + Sync {
    /// Whether the platform gates BLE behind runtime grants at all.
    fn requires_runtime_grants(&self) -> bool;

    /// Platform API level, e.g. `"31"`. `None` when it cannot be determined.
    fn api_level(&self) -> Option<String>;

    /// Requests `permissions`, returning one status per entry in the same order.
    fn request_permissions(&self, permissions: Vec<Permission>) -> Vec<PermissionStatus>;
}

/// Permissions needed at `api_level`; an unknown level yields the superset.
pub fn required_permissions(api_level: Option<u32>, threshold: u32) -> Vec<Permission> {
    match api_level {
        Some(level) if level < threshold => vec![Permission::CoarseLocation],
        Some(_) => vec![
            Permission::BluetoothScan,
            Permission::BluetoothConnect,
            Permission::FineLocation,
        ],
        None => vec![
            Permission::CoarseLocation,
            Permission::BluetoothScan,
            Permission::BluetoothConnect,
            Permission::FineLocation,
        ],
    }
}

fn version_number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |digits: &str| digits.parse::<u32>()).parse(input)
}

fn leading_version(input: &str) -> IResult<&str, u32> {
    preceded(take_till(|c: char| c.is_ascii_digit()), version_number).parse(input)
}

/// Extracts the first numeric component of a platform version string.
///
/// Accepts `"31"`, `"API 33"`, `"android-30"` and `"14.2.1"` (yielding 14).
pub fn parse_api_level(raw: &str) -> Option<u32> {
    leading_version(raw.trim()).ok().map(|(_, level)| level)
}

/// Reduces per-permission statuses; every requested permission must be granted.
pub fn aggregate(requested: usize, statuses: &[PermissionStatus]) -> PermissionResult {
    if statuses.len() < requested {
        return PermissionResult::denied(DenialReason::Denied);
    }
    let any = |wanted: PermissionStatus| statuses.iter().any(|s| *s == wanted);
    if any(PermissionStatus::NeverAskAgain) {
        PermissionResult::denied(DenialReason::NotRequestable)
    } else if any(PermissionStatus::Unavailable) {
        PermissionResult::denied(DenialReason::PlatformNotApplicable)
    } else if any(PermissionStatus::Denied) {
        PermissionResult::denied(DenialReason::Denied)
    } else {
        PermissionResult::granted()
    }
}

fn negotiate(platform: &dyn PermissionPlatform, threshold: u32) -> PermissionResult {
    if !platform.requires_runtime_grants() {
        return PermissionResult::granted();
    }
    let raw_level = platform.api_level();
    let level = raw_level.as_deref().and_then(parse_api_level);
    if level.is_none() {
        warn!(raw = ?raw_level, "api level unknown, requesting every permission");
    }
    let required = required_permissions(level, threshold);
    debug!(?required, "requesting permissions");
    let statuses = platform.request_permissions(required.clone());
    aggregate(required.len(), &statuses)
}

/// Serialises permission negotiation; at most one request is shown at a time.
pub struct PermissionNegotiator {
    platform: Arc<dyn PermissionPlatform>,
    threshold: u32,
    in_flight: Mutex<()>,
}

impl PermissionNegotiator {
    pub fn new(platform: Arc<dyn PermissionPlatform>, threshold: u32) -> Self {
        Self {
            platform,
            threshold,
            in_flight: Mutex::new(()),
        }
    }

    pub async fn ensure_permissions(&self) -> PermissionResult {
        let _guard = self.in_flight.lock().await;
        let platform = Arc::clone(&self.platform);
        let threshold = self.threshold;
        let result = tokio::task::spawn_blocking(move || negotiate(platform.as_ref(), threshold))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "permission bridge panicked");
                PermissionResult::denied(DenialReason::Denied)
            });
        info!(granted = result.granted, reason = ?result.reason, "permission negotiation finished");
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Platform bridge answering every request with fixed statuses.
    pub(crate) struct FakePlatform {
        pub runtime_grants: bool,
        pub api_level: Option<String>,
        pub answer: PermissionStatus,
        pub requested: std::sync::Mutex<Vec<Vec<Permission>>>,
        pub concurrent: AtomicUsize,
        pub max_concurrent: AtomicUsize,
    }

    impl FakePlatform {
        pub(crate) fn answering(answer: PermissionStatus) -> Self {
            Self {
                runtime_grants: true,
                api_level: Some("31".to_string()),
                answer,
                requested: std::sync::Mutex::new(Vec::new()),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }
    }

    impl PermissionPlatform for FakePlatform {
        fn requires_runtime_grants(&self) -> bool {
            self.runtime_grants
        }

        fn api_level(&self) -> Option<String> {
            self.api_level.clone()
        }

        fn request_permissions(&self, permissions: Vec<Permission>) -> Vec<PermissionStatus> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            let statuses = permissions.iter().map(|_| self.answer).collect();
            self.requested.lock().unwrap().push(permissions);
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            statuses
        }
    }

    #[test]
    fn test_required_permissions_by_level() {
        assert_eq!(
            required_permissions(Some(30), 31),
            vec![Permission::CoarseLocation]
        );
        let modern = required_permissions(Some(31), 31);
        assert_eq!(modern.len(), 3);
        assert!(modern.contains(&Permission::BluetoothScan));
        assert!(modern.contains(&Permission::BluetoothConnect));
        assert!(modern.contains(&Permission::FineLocation));
        assert_eq!(required_permissions(None, 31).len(), 4);
    }

    #[test]
    fn test_parse_api_level() {
        assert_eq!(parse_api_level("31"), Some(31));
        assert_eq!(parse_api_level("API 33"), Some(33));
        assert_eq!(parse_api_level("android-30"), Some(30));
        assert_eq!(parse_api_level(" 14.2.1 "), Some(14));
        assert_eq!(parse_api_level("unknown"), None);
        assert_eq!(parse_api_level(""), None);
    }

    #[test]
    fn test_partial_grant_is_denial() {
        let statuses = [PermissionStatus::Granted, PermissionStatus::Denied];
        assert_eq!(
            aggregate(2, &statuses),
            PermissionResult::denied(DenialReason::Denied)
        );
        assert_eq!(
            aggregate(3, &[PermissionStatus::Granted, PermissionStatus::Granted]),
            PermissionResult::denied(DenialReason::Denied)
        );
        assert!(aggregate(2, &[PermissionStatus::Granted; 2]).granted);
    }

    #[test]
    fn test_denial_reason_priority() {
        let statuses = [
            PermissionStatus::Denied,
            PermissionStatus::Unavailable,
            PermissionStatus::NeverAskAgain,
        ];
        assert_eq!(
            aggregate(3, &statuses).reason,
            Some(DenialReason::NotRequestable)
        );
        assert_eq!(
            aggregate(2, &[PermissionStatus::Denied, PermissionStatus::Unavailable]).reason,
            Some(DenialReason::PlatformNotApplicable)
        );
    }

    #[tokio::test]
    async fn test_unknown_level_requests_superset() {
        let mut platform = FakePlatform::answering(PermissionStatus::Granted);
        platform.api_level = Some("n/a".to_string());
        let platform = Arc::new(platform);
        let negotiator = PermissionNegotiator::new(platform.clone(), 31);
        assert!(negotiator.ensure_permissions().await.granted);
        assert_eq!(platform.requested.lock().unwrap()[0].len(), 4);
    }

    #[tokio::test]
    async fn test_platform_without_runtime_grants() {
        let mut platform = FakePlatform::answering(PermissionStatus::Denied);
        platform.runtime_grants = false;
        let platform = Arc::new(platform);
        let negotiator = PermissionNegotiator::new(platform.clone(), 31);
        assert_eq!(
            negotiator.ensure_permissions().await,
            PermissionResult::granted()
        );
        assert!(platform.requested.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_are_serialised() {
        let platform = Arc::new(FakePlatform::answering(PermissionStatus::Granted));
        let negotiator = Arc::new(PermissionNegotiator::new(platform.clone(), 31));
        let calls: Vec<_> = (0..4)
            .map(|_| {
                let negotiator = Arc::clone(&negotiator);
                tokio::spawn(async move { negotiator.ensure_permissions().await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().granted);
        }
        assert_eq!(platform.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(platform.requested.lock().unwrap().len(), 4);
    }
}
