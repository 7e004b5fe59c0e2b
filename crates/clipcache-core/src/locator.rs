//! Finds the recorder file behind a (camera, instant) pair by listing the
//! hour folders around the target and matching embedded filename timestamps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock;
use crate::config::LocatorConfig;
use crate::key::CacheKey;
use crate::session::SessionCache;
use crate::upstream::{Listing, NvrApi, UpstreamError};

/// Hour offsets searched around the target, nearest first.
const HOUR_OFFSETS: [i64; 3] = [0, -1, 1];
/// Primary folder, then the secondary copy the recorder keeps for some hours.
const FOLDER_SUFFIXES: [&str; 2] = ["", "D"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteClipDescriptor {
    /// Folder holding the file, e.g. `/mnt/HD/cam1/2023-11-14/23`.
    pub remote_path: String,
    pub remote_filename: String,
    /// Start of the recording, UTC seconds.
    pub timestamp: i64,
    pub camera_id: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LocateError {
    #[error("camera {0} is not configured")]
    InvalidCamera(u32),
    #[error("no recording for camera {camera_id} within {window_secs}s of {target}")]
    NotFound {
        camera_id: u32,
        target: i64,
        window_secs: i64,
    },
    #[error("camera {camera_id} unreachable: {reason}")]
    CameraUnavailable { camera_id: u32, reason: String },
}

static FILENAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 2023-11-14_22-13-20, 2023-11-14 22:13:20, 2023-11-14-22-13-20
        r"(?:^|[^0-9])(\d{4})-(\d{2})-(\d{2})[ _T-](\d{2})[-:.](\d{2})[-:.](\d{2})(?:[^0-9]|$)",
        // 2023-11-14_221320
        r"(?:^|[^0-9])(\d{4})-(\d{2})-(\d{2})_(\d{2})(\d{2})(\d{2})(?:[^0-9]|$)",
        // 20231114_221320
        r"(?:^|[^0-9])(\d{4})(\d{2})(\d{2})_(\d{2})(\d{2})(\d{2})(?:[^0-9]|$)",
        // 20231114221320
        r"(?:^|[^0-9])(\d{4})(\d{2})(\d{2})(\d{2})(\d{2})(\d{2})(?:[^0-9]|$)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("filename timestamp pattern"))
    .collect()
});

/// Recording start embedded in a recorder filename, as UTC seconds. The
/// recorder names files in its local wall-clock time.
pub fn parse_filename_timestamp(filename: &str) -> Option<i64> {
    for pattern in FILENAME_PATTERNS.iter() {
        let Some(caps) = pattern.captures(filename) else {
            continue;
        };
        let field = |i: usize| caps[i].parse::<u32>().ok();
        let date = NaiveDate::from_ymd_opt(caps[1].parse().ok()?, field(2)?, field(3)?);
        let Some(naive) = date.and_then(|d| d.and_hms_opt(field(4)?, field(5)?, field(6)?)) else {
            continue;
        };
        let local_secs = Utc.from_utc_datetime(&naive).timestamp();
        return Some(clock::local_to_utc(local_secs));
    }
    None
}

/// `YYYY-MM-DD/HH` folders to search for `target`, nearest hour first and
/// without repeats (the autumn fallback maps two UTC hours onto one local hour).
pub fn search_folders(target: i64) -> Vec<String> {
    let mut folders: Vec<String> = Vec::with_capacity(HOUR_OFFSETS.len());
    for offset in HOUR_OFFSETS {
        let Some(local) = clock::utc_to_local_date(target + offset * 3600) else {
            continue;
        };
        let folder = format!("{}/{}", local.folder_date(), local.folder_hour());
        if !folders.contains(&folder) {
            folders.push(folder);
        }
    }
    folders
}

fn closest_match(listing: &Listing, target: i64, window_secs: i64) -> Option<(String, i64)> {
    listing
        .entries
        .iter()
        .filter_map(|entry| {
            let ts = parse_filename_timestamp(&entry.filename)?;
            let distance = (ts - target).abs();
            (distance <= window_secs).then(|| (distance, entry.filename.clone(), ts))
        })
        .min_by_key(|(distance, _, _)| *distance)
        .map(|(_, filename, ts)| (filename, ts))
}

pub struct ClipLocator {
    cameras: HashMap<u32, String>,
    api: Arc<dyn NvrApi>,
    session: Arc<SessionCache>,
    descriptors: Cache<String, RemoteClipDescriptor>,
    window_secs: i64,
}

impl ClipLocator {
    pub fn new(
        settings: &LocatorConfig,
        cameras: HashMap<u32, String>,
        api: Arc<dyn NvrApi>,
        session: Arc<SessionCache>,
    ) -> Self {
        let descriptors = Cache::builder()
            .max_capacity(settings.descriptor_cache_capacity.max(1))
            .time_to_live(Duration::from_secs(settings.descriptor_ttl_secs.max(1)))
            .build();
        Self {
            cameras,
            api,
            session,
            descriptors,
            window_secs: settings.match_window_secs as i64,
        }
    }

    /// Locate the clip named by `key`, reusing a previous answer for the same key.
    pub async fn locate_key(&self, key: &CacheKey) -> Result<RemoteClipDescriptor, LocateError> {
        if let Some(hit) = self.descriptors.get(key.as_str()).await {
            debug!(key = %key, "descriptor cache hit");
            return Ok(hit);
        }
        let found = self.locate(key.camera_id(), key.timestamp()).await?;
        self.descriptors
            .insert(key.as_str().to_string(), found.clone())
            .await;
        Ok(found)
    }

    /// Forget a cached descriptor, e.g. once the recorder no longer serves it.
    pub async fn forget(&self, key: &CacheKey) {
        self.descriptors.invalidate(key.as_str()).await;
    }

    pub async fn locate(
        &self,
        camera_id: u32,
        target: i64,
    ) -> Result<RemoteClipDescriptor, LocateError> {
        let root = self
            .cameras
            .get(&camera_id)
            .ok_or(LocateError::InvalidCamera(camera_id))?;
        let token =
            self.session
                .get_token()
                .await
                .map_err(|err| LocateError::CameraUnavailable {
                    camera_id,
                    reason: format!("login failed: {err}"),
                })?;

        let mut attempts = 0usize;
        let mut failures = 0usize;
        let mut last_error: Option<UpstreamError> = None;
        for folder in search_folders(target) {
            for suffix in FOLDER_SUFFIXES {
                let date_path = format!("{folder}{suffix}");
                attempts += 1;
                let listing = match self.api.list(root, &date_path, &token).await {
                    Ok(listing) => listing,
                    Err(err) => {
                        warn!(camera_id, folder = %date_path, error = %err, "recorder listing failed");
                        failures += 1;
                        last_error = Some(err);
                        continue;
                    }
                };
                if let Some((remote_filename, timestamp)) =
                    closest_match(&listing, target, self.window_secs)
                {
                    debug!(
                        camera_id,
                        folder = %date_path,
                        file = %remote_filename,
                        skew_secs = timestamp - target,
                        "located recording"
                    );
                    return Ok(RemoteClipDescriptor {
                        remote_path: format!("{root}/{date_path}"),
                        remote_filename,
                        timestamp,
                        camera_id,
                    });
                }
            }
        }

        if attempts > 0 && failures == attempts {
            if matches!(last_error, Some(UpstreamError::Unauthorized)) {
                self.session.invalidate().await;
            }
            return Err(LocateError::CameraUnavailable {
                camera_id,
                reason: last_error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "no listing succeeded".into()),
            });
        }
        Err(LocateError::NotFound {
            camera_id,
            target,
            window_secs: self.window_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeNvr;

    const ROOT: &str = "/mnt/HD/cam1";

    fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, mi, s).unwrap().timestamp()
    }

    fn locator(nvr: Arc<FakeNvr>) -> ClipLocator {
        let api: Arc<dyn NvrApi> = nvr;
        let session = Arc::new(SessionCache::new(api.clone(), Duration::from_secs(60)));
        let cameras = HashMap::from([(1u32, ROOT.to_string())]);
        ClipLocator::new(&LocatorConfig::default(), cameras, api, session)
    }

    #[test]
    fn parses_supported_filename_conventions() {
        // 2023-11-14 23:13:20 local (CET) is 22:13:20 UTC.
        let expected = utc(2023, 11, 14, 22, 13, 20);
        for name in [
            "ch01_20231114_231320.mp4",
            "2023-11-14_23-13-20.mp4",
            "rec-2023-11-14-23-13-20-main.mp4",
            "2023-11-14_231320.mp4",
            "20231114231320.mp4",
            "ch01_20231114231320_0001.mp4",
        ] {
            assert_eq!(parse_filename_timestamp(name), Some(expected), "{name}");
        }
        assert_eq!(parse_filename_timestamp("index.dat"), None);
        assert_eq!(parse_filename_timestamp("20231399_231320.mp4"), None);
    }

    #[test]
    fn search_window_covers_neighbouring_hours() {
        let target = utc(2023, 11, 14, 22, 13, 20);
        assert_eq!(
            search_folders(target),
            vec!["2023-11-14/23", "2023-11-14/22", "2023-11-15/00"]
        );
    }

    #[test]
    fn search_window_skips_repeated_autumn_hour() {
        // 00:30 UTC is 02:30 CEST; +1h is 02:30 CET again.
        let target = utc(2024, 10, 27, 0, 30, 0);
        assert_eq!(
            search_folders(target),
            vec!["2024-10-27/02", "2024-10-27/01"]
        );
    }

    #[tokio::test]
    async fn unknown_camera_makes_no_remote_calls() {
        let nvr = Arc::new(FakeNvr::new());
        let locator = locator(nvr.clone());
        let err = locator.locate(9, 1_700_000_000).await.unwrap_err();
        assert!(matches!(err, LocateError::InvalidCamera(9)));
        assert_eq!(nvr.login_calls(), 0);
        assert_eq!(nvr.list_calls(), 0);
    }

    #[tokio::test]
    async fn finds_clip_in_primary_folder_of_target_hour() {
        let target = utc(2023, 11, 14, 22, 13, 20);
        let nvr = Arc::new(FakeNvr::new().with_folder(
            ROOT,
            "2023-11-14/23",
            &["ch01_20231114_230000.mp4", "ch01_20231114_231330.mp4"],
        ));
        let found = locator(nvr.clone()).locate(1, target).await.unwrap();
        assert_eq!(found.remote_filename, "ch01_20231114_231330.mp4");
        assert_eq!(found.remote_path, "/mnt/HD/cam1/2023-11-14/23");
        assert_eq!(found.timestamp, target + 10);
        assert_eq!(nvr.list_calls(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_secondary_folder() {
        let target = utc(2023, 11, 14, 22, 13, 20);
        let nvr = Arc::new(
            FakeNvr::new()
                .with_folder(ROOT, "2023-11-14/23", &["ch01_20231114_230000.mp4"])
                .with_folder(ROOT, "2023-11-14/23D", &["ch01_20231114_231300.mp4"]),
        );
        let found = locator(nvr.clone()).locate(1, target).await.unwrap();
        assert_eq!(found.remote_path, "/mnt/HD/cam1/2023-11-14/23D");
        assert_eq!(
            nvr.listed_paths(),
            vec!["/mnt/HD/cam1/2023-11-14/23", "/mnt/HD/cam1/2023-11-14/23D"]
        );
    }

    #[tokio::test]
    async fn empty_window_is_not_found() {
        let nvr = Arc::new(FakeNvr::new());
        let err = locator(nvr.clone())
            .locate(1, utc(2023, 11, 14, 22, 13, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, LocateError::NotFound { camera_id: 1, .. }));
        assert_eq!(nvr.list_calls(), 6);
    }

    #[tokio::test]
    async fn every_listing_failing_is_camera_unavailable() {
        let nvr = Arc::new(FakeNvr::new());
        nvr.fail_all_listings(true);
        let err = locator(nvr.clone())
            .locate(1, utc(2023, 11, 14, 22, 13, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, LocateError::CameraUnavailable { .. }));
        assert_eq!(nvr.list_calls(), 6);
    }

    #[tokio::test]
    async fn partial_failures_still_report_not_found() {
        let nvr = Arc::new(FakeNvr::new().with_failing_folder(ROOT, "2023-11-14/23"));
        let err = locator(nvr)
            .locate(1, utc(2023, 11, 14, 22, 13, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, LocateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn descriptor_cache_skips_repeat_searches() {
        let target = utc(2023, 11, 14, 22, 13, 20);
        let nvr = Arc::new(FakeNvr::new().with_folder(
            ROOT,
            "2023-11-14/22",
            &["ch01_20231114_231300.mp4"],
        ));
        let locator = locator(nvr.clone());
        let key = CacheKey::parse(&format!("cam1_{target}_abcdef12.mp4")).unwrap();
        let first = locator.locate_key(&key).await.unwrap();
        let calls = nvr.list_calls();
        let second = locator.locate_key(&key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(nvr.list_calls(), calls);

        locator.forget(&key).await;
        locator.locate_key(&key).await.unwrap();
        assert!(nvr.list_calls() > calls);
    }
}
