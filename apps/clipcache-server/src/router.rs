use axum::middleware;
use axum::routing::get;
use axum::Router;

use crate::{access_log, api_clips, api_meta, AppState};

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const ABOUT: &str = "/about";
    pub const VIDEOS_NAME: &str = "/videos/{name}";
    pub const ADMIN_CLIPS_STATS: &str = "/admin/clips/stats";
}

pub(crate) fn build(state: AppState) -> Router {
    Router::new()
        .route(paths::HEALTHZ, get(api_meta::healthz))
        .route(paths::ABOUT, get(api_meta::about))
        .route(paths::VIDEOS_NAME, get(api_clips::clip_get))
        .route(paths::ADMIN_CLIPS_STATS, get(api_clips::clip_stats))
        .layer(middleware::from_fn(access_log::access_log_mw))
        .with_state(state)
}
