#![allow(dead_code)]

use pdubridge::ChangsuiConfig;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const OVERVIEW_BODY: &str = "0d\n1d\n2d\n320d\n2201d\n700d\n985d\n123456d\n";
pub const DAILY_ENERGY_BODY: &str = "a\nb\nc\n100d,350d,250d\nOutlet1,10d,30d,20d\nend";

/// `outlet.cgi` body; `on` lists the 1-based outlets that are switched on.
pub fn outlets_body(count: usize, on: &[usize]) -> String {
    let header = if count == 20 { 3 } else { 4 };
    let mut lines: Vec<String> = (0..header).map(|i| format!("{}d", i)).collect();
    for i in 1..=count {
        lines.push(format!("Outlet{}", i));
        lines.push(if on.contains(&i) { "0d" } else { "1d" }.to_string());
        lines.push(format!("{}d", 10 * i));
        lines.push(format!("{}d", 5 * i));
        lines.push("0d".to_string());
        lines.push("1000d".to_string());
        for _ in 0..5 {
            lines.push("0d".to_string());
        }
    }
    lines.push("end".to_string());
    lines.join("\n")
}

pub fn client_config(server: &MockServer) -> ChangsuiConfig {
    ChangsuiConfig {
        outlets: 8,
        retry_base_ms: 1,
        request_timeout_secs: 5,
        ..ChangsuiConfig::new(server.uri())
    }
}

pub async fn mount_login(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/login.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(server)
        .await;
}

/// Mounts a healthy 8-outlet PDU with outlets 1 and 3 on.
pub async fn mount_healthy_pdu(server: &MockServer) {
    mount_login(server).await;
    mount_status(server, Duration::ZERO).await;
}

pub async fn mount_status(server: &MockServer, overview_delay: Duration) {
    Mock::given(method("GET"))
        .and(path("/pm.cgi"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(OVERVIEW_BODY)
                .set_delay(overview_delay),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/outlet.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(outlets_body(8, &[1, 3])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/energy.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DAILY_ENERGY_BODY))
        .mount(server)
        .await;
}

pub async fn requests_to(server: &MockServer, target: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == target)
        .count()
}

/// Polls `check` until it holds or `within` elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
