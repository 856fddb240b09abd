use async_trait::async_trait;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CalDavError {
    #[error("resource not found")]
    NotFound,
    #[error("precondition failed: {0}")]
    Conflict(String),
    #[error("authentication failed")]
    Auth,
    #[error("network error: {0}")]
    Network(String),
    #[error("server error: {0}")]
    Server(String),
}

#[derive(Debug, Clone)]
pub struct RemoteCalendar {
    pub href: Url,
    pub display_name: String,
    pub color_rrggbb: Option<String>,
    pub ctag: Option<String>,
    pub is_read_only: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteResource {
    pub url: Url,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct RemoteBody {
    pub body: String,
    pub etag: String,
}

/// The abstract CalDAV client the sync core consumes. Wire-protocol details
/// (HTTP transport, auth headers, XML bodies) are an external collaborator's
/// problem; the core only needs these operations.
#[async_trait]
pub trait CalDavClient: Send + Sync {
    async fn discover_well_known(&self, base_url: &Url) -> Result<Url, CalDavError>;
    async fn discover_principal(&self, url: &Url) -> Result<Url, CalDavError>;
    async fn discover_calendar_home(&self, principal_url: &Url) -> Result<Vec<Url>, CalDavError>;
    async fn list_calendars(&self, home_set_url: &Url) -> Result<Vec<RemoteCalendar>, CalDavError>;
    async fn list_resources(&self, calendar_url: &Url) -> Result<Vec<RemoteResource>, CalDavError>;
    async fn get_resource(&self, url: &Url) -> Result<RemoteBody, CalDavError>;
    async fn create_event(
        &self,
        calendar_url: &Url,
        uid: &str,
        ical_body: &str,
    ) -> Result<(Url, String), CalDavError>;
    async fn update_event(
        &self,
        resource_url: &Url,
        ical_body: &str,
        if_match_etag: &str,
    ) -> Result<String, CalDavError>;
    async fn delete_event(&self, resource_url: &Url, if_match_etag: &str) -> Result<(), CalDavError>;
}

/// Host paths probed, in order, when `.well-known/caldav` on a host 404s.
/// Probing must stay on the original host, never follow to a redirect host.
pub const DISCOVERY_PROBE_PATHS: &[&str] = &["", "/dav/", "/caldav/", "/remote.php/dav/", "/dav.php/"];
