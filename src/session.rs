//! Changsui HTTP session management.
//! Owns the login cookie for one PDU, re-authenticates transparently and
//! wraps every firmware endpoint the poller and the command router need.

use crate::changsui::{
    self, DailyEnergy, OutletEnergy, OutletReading, Overview, PATH_DAILY_ENERGY, PATH_LOGIN,
    PATH_OUTLET_ENERGY, PATH_OUTLET_PAGE, PATH_OUTLETS, PATH_OVERVIEW, StatusSnapshot,
};
use crate::config::ChangsuiConfig;
use crate::error::{PduError, Result};
use chrono::{Datelike, Local, NaiveDate};
use log::{debug, info, warn};
use reqwest::StatusCode;
use reqwest::header::{COOKIE, REFERER};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;
use tokio::time::{Duration, sleep};

const MAX_ATTEMPTS: u32 = 3;
const LOGIN_BACKOFF_MAX: Duration = Duration::from_secs(600);
const BODY_SAMPLE: usize = 200;

/// Authenticated context reused across requests.
#[derive(Debug, Clone)]
struct Session {
    cookie: String,
    established_at: Instant,
    expires_at: Option<Instant>,
}

impl Session {
    fn is_valid(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    session: Option<Session>,
    consecutive_failures: u32,
    auth_failures: u32,
    next_login_at: Option<Instant>,
    login_count: u64,
    last_error: Option<String>,
}

/// Point-in-time view of a session, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub host: String,
    pub logged_in: bool,
    pub session_age_secs: Option<u64>,
    pub consecutive_failures: u32,
    pub login_count: u64,
    pub last_error: Option<String>,
}

/// HTTP client plus session for one Changsui PDU.
pub struct ChangsuiClient {
    config: ChangsuiConfig,
    base_url: String,
    http: reqwest::Client,
    // Held across the login round-trip so concurrent callers wait for one login
    login_gate: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

impl ChangsuiClient {
    pub fn new(config: ChangsuiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url(),
            config,
            http,
            login_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn device_id(&self) -> String {
        self.config.device_id()
    }

    pub fn config(&self) -> &ChangsuiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn cookie(&self) -> String {
        format!(
            "usrname={}; password={}; lg=0; inst=0; outlet_index=16",
            self.config.username, self.config.password
        )
    }

    fn backoff(&self, failures: u32) -> Duration {
        scaled(self.config.retry_base(), failures.saturating_sub(1).min(6))
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    /// Returns the session cookie, logging in first if there is no valid session.
    ///
    /// After a rejected login further attempts are refused until the backoff
    /// window has passed. Status reads never wait for a login in progress.
    pub async fn ensure_session(&self) -> Result<String> {
        if let Some(cookie) = self.current_cookie()? {
            return Ok(cookie);
        }

        let _gate = self.login_gate.lock().await;
        // Another caller may have logged in while we waited
        if let Some(cookie) = self.current_cookie()? {
            return Ok(cookie);
        }

        let result = self.login_with_retries().await;
        let mut state = self.state.lock();
        match result {
            Ok(session) => {
                let cookie = session.cookie.clone();
                state.session = Some(session);
                state.auth_failures = 0;
                state.next_login_at = None;
                state.login_count += 1;
                Ok(cookie)
            }
            Err(e) => {
                if matches!(e, PduError::AuthFailed(_)) {
                    state.auth_failures += 1;
                    let wait = self.backoff(state.auth_failures);
                    warn!(
                        "Login to {} rejected ({} in a row), next attempt in {}s",
                        self.config.host,
                        state.auth_failures,
                        wait.as_secs()
                    );
                    state.next_login_at = Instant::now().checked_add(wait);
                }
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Cookie of a still-valid session, or an error inside the login backoff window.
    fn current_cookie(&self) -> Result<Option<String>> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if let Some(session) = &state.session {
            if session.is_valid(now) {
                return Ok(Some(session.cookie.clone()));
            }
            debug!("Session for {} expired, logging in again", self.config.host);
            state.session = None;
        }

        if let Some(at) = state.next_login_at {
            if now < at {
                return Err(PduError::AuthFailed(format!(
                    "login to {} backing off for {}s",
                    self.config.host,
                    (at - now).as_secs()
                )));
            }
        }
        Ok(None)
    }

    async fn login_with_retries(&self) -> Result<Session> {
        let mut last_err = PduError::Network(format!("no login attempt to {}", self.config.host));

        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .http
                .get(self.url(PATH_LOGIN))
                .query(&[
                    ("login", "1"),
                    ("name", self.config.username.as_str()),
                    ("psd", self.config.password.as_str()),
                ])
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    debug!(
                        "[Login] status={}, response={}",
                        status,
                        sample(&text)
                    );
                    if status == StatusCode::OK {
                        info!("Logged in to Changsui PDU {}", self.config.host);
                        let now = Instant::now();
                        return Ok(Session {
                            cookie: self.cookie(),
                            established_at: now,
                            expires_at: self
                                .config
                                .session_ttl()
                                .and_then(|ttl| now.checked_add(ttl)),
                        });
                    }
                    return Err(PduError::AuthFailed(format!(
                        "login to {} returned HTTP {}",
                        self.config.host, status
                    )));
                }
                Err(e) => {
                    warn!(
                        "Login attempt {} to {} failed: {}",
                        attempt + 1,
                        self.config.host,
                        e
                    );
                    last_err = e.into();
                    if attempt + 1 < MAX_ATTEMPTS {
                        sleep(scaled(self.config.retry_base(), attempt)).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Drops the current session; the next request logs in again.
    pub fn invalidate_session(&self) {
        self.state.lock().session = None;
    }

    /// Marks the current session as expired without dropping the cookie.
    pub fn expire_session(&self) {
        if let Some(session) = self.state.lock().session.as_mut() {
            session.expires_at = Some(Instant::now());
        }
    }

    pub fn close(&self) {
        self.state.lock().session = None;
        debug!("Session for {} closed", self.config.host);
    }

    /// Records the outcome of a poll and returns the consecutive failure count.
    pub fn record_poll(&self, result: &Result<()>) -> u32 {
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.consecutive_failures = 0;
                state.last_error = None;
            }
            Err(e) => {
                state.consecutive_failures += 1;
                state.last_error = Some(e.to_string());
            }
        }
        state.consecutive_failures
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock();
        let now = Instant::now();
        let active = state.session.as_ref().filter(|s| s.is_valid(now));
        SessionStatus {
            host: self.config.host.clone(),
            logged_in: active.is_some(),
            session_age_secs: active.map(|s| now.duration_since(s.established_at).as_secs()),
            consecutive_failures: state.consecutive_failures,
            login_count: state.login_count,
            last_error: state.last_error.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    async fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let cookie = self.ensure_session().await?;
        let result = self
            .http
            .get(self.url(path))
            .query(query)
            .header(COOKIE, cookie)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                // Firmware drops sessions on reconnect; start fresh next time
                self.invalidate_session();
                return Err(e.into());
            }
        };

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.invalidate_session();
            return Err(PduError::AuthFailed(format!(
                "{} rejected session with HTTP {}",
                path, status
            )));
        }
        if status != StatusCode::OK {
            return Err(PduError::Network(format!("{} returned HTTP {}", path, status)));
        }

        let text = resp.text().await?;
        debug!("[{}] status={}, sample={}", path, status, sample(&text));
        Ok(text)
    }

    pub async fn fetch_overview(&self) -> Result<Overview> {
        let body = self
            .get_text(PATH_OVERVIEW, &[("pdu_index", "0".to_string())])
            .await?;
        changsui::parse_overview(&body)
    }

    pub async fn fetch_outlets(&self) -> Result<Vec<OutletReading>> {
        let body = self
            .get_text(PATH_OUTLETS, &[("pdu_index", "0".to_string())])
            .await?;
        changsui::parse_outlets(&body, self.config.outlets)
    }

    pub async fn fetch_daily_energy(&self, date: NaiveDate) -> Result<DailyEnergy> {
        let (y, m, d) = (
            date.year().to_string(),
            date.month().to_string(),
            date.day().to_string(),
        );
        let query = [
            ("pdu_index", "0".to_string()),
            ("sy", y.clone()),
            ("sm", m.clone()),
            ("sd", d.clone()),
            ("ey", y),
            ("em", m),
            ("ed", d),
        ];
        let body = self.get_text(PATH_DAILY_ENERGY, &query).await?;
        changsui::parse_daily_energy(&body)
    }

    pub async fn fetch_outlet_energy(&self) -> Result<Vec<OutletEnergy>> {
        let body = self
            .get_text(PATH_OUTLET_ENERGY, &[("pdu_index", "0".to_string())])
            .await?;
        changsui::parse_outlet_energy(&body)
    }

    /// One full status read: overview and outlets are required, energy is best effort.
    pub async fn fetch_status(&self) -> Result<StatusSnapshot> {
        let overview = self.fetch_overview().await?;
        let outlets = self.fetch_outlets().await?;

        let daily = match self.fetch_daily_energy(Local::now().date_naive()).await {
            Ok(daily) => Some(daily),
            Err(e) => {
                warn!("Daily energy for {} unavailable: {}", self.config.host, e);
                None
            }
        };

        let mut snapshot = StatusSnapshot::new(&overview, outlets, daily.as_ref());
        if self.config.show_outlet_energy {
            match self.fetch_outlet_energy().await {
                Ok(energy) => snapshot.outlet_energy = energy,
                Err(e) => warn!("Outlet energy for {} unavailable: {}", self.config.host, e),
            }
        }
        Ok(snapshot)
    }

    /// Switches one outlet. Retries are safe because the command is absolute.
    pub async fn set_outlet(&self, index: usize, is_on: bool) -> Result<()> {
        if index == 0 || index > self.config.outlets {
            return Err(PduError::InvalidOutlet {
                device_id: self.device_id(),
                index,
            });
        }

        let form = changsui::outlet_command_form(index, is_on);
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let cookie = self.ensure_session().await?;
            let result = self
                .http
                .post(self.url(PATH_OUTLETS))
                .header(COOKIE, cookie)
                .header(REFERER, self.url(PATH_OUTLET_PAGE))
                .form(&form)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    debug!(
                        "[attempt {}] outlet={} on={} status={} body={}",
                        attempt,
                        index,
                        is_on,
                        status,
                        sample(&text)
                    );
                    if status == StatusCode::OK && changsui::is_command_success(&text) {
                        info!(
                            "Outlet {} of {} switched {} (attempt {})",
                            index,
                            self.config.host,
                            if is_on { "on" } else { "off" },
                            attempt
                        );
                        return Ok(());
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        self.invalidate_session();
                    }
                    last_err = Some(PduError::ProtocolViolation(format!(
                        "outlet command answered HTTP {} without success marker",
                        status
                    )));
                }
                Err(e) => {
                    warn!(
                        "Attempt {} for outlet {} of {} failed: {}",
                        attempt, index, self.config.host, e
                    );
                    last_err = Some(e.into());
                }
            }

            if attempt < MAX_ATTEMPTS {
                sleep(scaled(self.config.retry_base(), attempt - 1)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PduError::Network(format!("outlet {} command never sent", index))
        }))
    }
}

fn sample(text: &str) -> String {
    text.chars().take(BODY_SAMPLE).collect()
}

/// `base * 2^exp`, saturating at the login backoff ceiling.
fn scaled(base: Duration, exp: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(exp))
        .map_or(LOGIN_BACKOFF_MAX, |d| d.min(LOGIN_BACKOFF_MAX))
}
