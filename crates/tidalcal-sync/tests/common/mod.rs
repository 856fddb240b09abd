//! In-memory fake `CalDavClient`, the same "mock what would be a real
//! server" idiom the teacher's own sync tests use for a mock remote source.
//! Held behind a mutex so it can be driven from async test bodies and
//! inspected afterward.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tidalcal_core::{CalDavClient, CalDavError, RemoteCalendar, RemoteResource, RemoteBody};
use url::Url;
use uuid::Uuid;

struct StoredResource {
    body: String,
    etag: String,
}

#[derive(Default)]
struct State {
    calendars: HashMap<Url, RemoteCalendar>,
    resources: HashMap<Url, StoredResource>,
    next_etag: u64,
    fail_next: Option<CalDavError>,
}

pub struct FakeCalDavClient {
    state: Mutex<State>,
}

impl FakeCalDavClient {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    pub fn add_calendar(&self, href: Url, ctag: &str) {
        let mut state = self.state.lock().unwrap();
        state.calendars.insert(
            href.clone(),
            RemoteCalendar { href, display_name: "Test".into(), color_rrggbb: None, ctag: Some(ctag.to_string()), is_read_only: false },
        );
    }

    pub fn bump_ctag(&self, href: &Url, ctag: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(cal) = state.calendars.get_mut(href) {
            cal.ctag = Some(ctag.to_string());
        }
    }

    pub fn seed_resource(&self, url: Url, body: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_etag += 1;
        let etag = format!("etag-{}", state.next_etag);
        state.resources.insert(url, StoredResource { body: body.to_string(), etag: etag.clone() });
        etag
    }

    pub fn fail_next_with(&self, error: CalDavError) {
        self.state.lock().unwrap().fail_next = Some(error);
    }

    fn take_failure(&self) -> Option<CalDavError> {
        self.state.lock().unwrap().fail_next.take()
    }
}

#[async_trait]
impl CalDavClient for FakeCalDavClient {
    async fn discover_well_known(&self, base_url: &Url) -> Result<Url, CalDavError> {
        Ok(base_url.clone())
    }

    async fn discover_principal(&self, url: &Url) -> Result<Url, CalDavError> {
        Ok(url.clone())
    }

    async fn discover_calendar_home(&self, principal_url: &Url) -> Result<Vec<Url>, CalDavError> {
        Ok(vec![principal_url.clone()])
    }

    async fn list_calendars(&self, _home_set_url: &Url) -> Result<Vec<RemoteCalendar>, CalDavError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().unwrap().calendars.values().cloned().collect())
    }

    async fn list_resources(&self, calendar_url: &Url) -> Result<Vec<RemoteResource>, CalDavError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .resources
            .iter()
            .filter(|(url, _)| url.as_str().starts_with(calendar_url.as_str()))
            .map(|(url, stored)| RemoteResource { url: url.clone(), etag: stored.etag.clone() })
            .collect())
    }

    async fn get_resource(&self, url: &Url) -> Result<RemoteBody, CalDavError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        let stored = state.resources.get(url).ok_or(CalDavError::NotFound)?;
        Ok(RemoteBody { body: stored.body.clone(), etag: stored.etag.clone() })
    }

    async fn create_event(&self, calendar_url: &Url, uid: &str, ical_body: &str) -> Result<(Url, String), CalDavError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        state.next_etag += 1;
        let etag = format!("etag-{}", state.next_etag);
        let resource_url = calendar_url.join(&format!("{uid}.ics")).map_err(|e| CalDavError::Server(e.to_string()))?;
        state.resources.insert(resource_url.clone(), StoredResource { body: ical_body.to_string(), etag: etag.clone() });
        Ok((resource_url, etag))
    }

    async fn update_event(&self, resource_url: &Url, ical_body: &str, if_match_etag: &str) -> Result<String, CalDavError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        if !matches!(state.resources.get(resource_url), Some(stored) if stored.etag == if_match_etag) {
            if !state.resources.contains_key(resource_url) {
                return Err(CalDavError::NotFound);
            }
            return Err(CalDavError::Conflict("etag mismatch".to_string()));
        }
        state.next_etag += 1;
        let etag = format!("etag-{}", state.next_etag);
        let stored = state.resources.get_mut(resource_url).unwrap();
        stored.body = ical_body.to_string();
        stored.etag = etag.clone();
        Ok(etag)
    }

    async fn delete_event(&self, resource_url: &Url, if_match_etag: &str) -> Result<(), CalDavError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        match state.resources.get(resource_url) {
            Some(stored) if stored.etag == if_match_etag => {
                state.resources.remove(resource_url);
                Ok(())
            }
            Some(_) => Err(CalDavError::Conflict("etag mismatch".to_string())),
            None => Err(CalDavError::NotFound),
        }
    }
}

pub fn random_uuid() -> Uuid {
    Uuid::new_v4()
}
