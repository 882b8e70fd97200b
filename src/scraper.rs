//! Per-outlet current readings scraped from the GWGJ device web page.

use crate::error::{PduError, Result};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

const REALTIME_FORM: &str = "realtime_btn=8&radio_function=&select_temp=0&is_mobile=0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"td2_(\d+)'?\)\.innerText\s*=\s*'([^']*)'").expect("static regex")
    })
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?[0-9]*\.?[0-9]+").expect("static regex"))
}

/// Extracts `(outlet index, amps)` pairs from the realtime page.
///
/// Cells without a number are skipped; values are rounded to milliamps.
pub fn parse_realtime(body: &str) -> Vec<(usize, f64)> {
    cell_re()
        .captures_iter(body)
        .filter_map(|caps| {
            let index: usize = caps[1].parse().ok()?;
            let value: f64 = number_re().find(caps[2].trim())?.as_str().parse().ok()?;
            (index > 0).then_some((index, (value * 1000.0).round() / 1000.0))
        })
        .collect()
}

pub struct OutletCurrentScraper {
    http: reqwest::Client,
    url: String,
}

impl OutletCurrentScraper {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: format!("http://{}:{}/", host, port),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> Result<Vec<(usize, f64)>> {
        let resp = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(REALTIME_FORM)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(PduError::Network(format!(
                "{} returned HTTP {}",
                self.url,
                resp.status()
            )));
        }
        let body = resp.text().await?;
        Ok(parse_realtime(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_cells() {
        let body = r#"
            document.getElementById('td2_1').innerText = '0.52A';
            document.getElementById('td2_2').innerText = ' 1.2346 ';
            document.getElementById('td2_3').innerText = '--';
            document.getElementById(td2_4).innerText='3'
        "#;
        assert_eq!(parse_realtime(body), vec![(1, 0.52), (2, 1.235), (4, 3.0)]);
    }

    #[test]
    fn unrelated_page_yields_nothing() {
        assert!(parse_realtime("<html>login</html>").is_empty());
    }
}
