//! Changsui HTTP payload decoding.
//! The firmware answers with line-oriented bodies whose numbers carry a
//! trailing `d`; every decoder here is pure and works on the raw body text.

use crate::device::{OutletUpdate, Telemetry};
use crate::error::{PduError, Result};
use log::warn;

pub const PATH_LOGIN: &str = "/login.cgi";
pub const PATH_OVERVIEW: &str = "/pm.cgi";
pub const PATH_OUTLETS: &str = "/outlet.cgi";
pub const PATH_DAILY_ENERGY: &str = "/energy.cgi";
pub const PATH_OUTLET_ENERGY: &str = "/outenergy.cgi";
pub const PATH_OUTLET_PAGE: &str = "/outlet.html";

/// Lines per outlet block in `outlet.cgi`.
const OUTLET_CHUNK: usize = 11;
const OVERVIEW_MIN_LINES: usize = 8;
const ENERGY_MIN_LINES: usize = 4;

const SUCCESS_MARKERS: &[&str] = &["success", "succesd"];

/// Whole-unit electrical readings from `pm.cgi`.
#[derive(Debug, Clone, PartialEq)]
pub struct Overview {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub power_factor: f64,
    pub energy_kwh: f64,
}

/// One outlet block from `outlet.cgi`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutletReading {
    pub index: usize,
    pub name: String,
    pub is_on: bool,
    pub current_a: f64,
    pub power_w: f64,
    pub current_min_a: Option<f64>,
    pub current_max_a: Option<f64>,
}

impl OutletReading {
    pub fn to_update(&self) -> OutletUpdate {
        OutletUpdate {
            is_on: Some(self.is_on),
            name: Some(self.name.clone()),
            power_w: Some(self.power_w),
            current_a: Some(self.current_a),
            current_min_a: self.current_min_a,
            current_max_a: self.current_max_a,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyWindow {
    pub start_kwh: f64,
    pub end_kwh: f64,
    pub today_kwh: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutletDailyEnergy {
    pub name: String,
    pub window: EnergyWindow,
}

/// Today's counters from `energy.cgi`.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyEnergy {
    pub total: EnergyWindow,
    pub outlets: Vec<OutletDailyEnergy>,
}

/// Lifetime energy per outlet from `outenergy.cgi`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutletEnergy {
    pub name: String,
    pub energy_kwh: f64,
}

/// Everything one poll tick produces, ready for the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub telemetry: Telemetry,
    pub outlets: Vec<OutletReading>,
    pub outlet_energy: Vec<OutletEnergy>,
}

impl StatusSnapshot {
    pub fn new(overview: &Overview, outlets: Vec<OutletReading>, daily: Option<&DailyEnergy>) -> Self {
        Self {
            telemetry: Telemetry {
                voltage_v: overview.voltage_v,
                current_a: overview.current_a,
                power_w: overview.power_w,
                power_factor: Some(overview.power_factor),
                energy_kwh_total: Some(overview.energy_kwh),
                energy_kwh_today: daily.map(|d| d.total.today_kwh),
            },
            outlets,
            outlet_energy: Vec::new(),
        }
    }
}

fn lines(body: &str) -> Vec<&str> {
    body.trim().split('\n').map(|l| l.trim_end_matches('\r')).collect()
}

fn int(line: &str, what: &str) -> Result<i64> {
    let cleaned = line.trim().trim_end_matches('d').trim();
    cleaned
        .parse()
        .map_err(|_| PduError::Decode(format!("{}: '{}' is not a number", what, line.trim())))
}

fn line<'a>(lines: &[&'a str], idx: usize, what: &str) -> Result<&'a str> {
    lines
        .get(idx)
        .copied()
        .ok_or_else(|| PduError::Decode(format!("{}: missing line {}", what, idx)))
}

pub fn parse_overview(body: &str) -> Result<Overview> {
    let lines = lines(body);
    if lines.len() < OVERVIEW_MIN_LINES {
        return Err(PduError::Decode(format!(
            "overview has {} lines, expected at least {}",
            lines.len(),
            OVERVIEW_MIN_LINES
        )));
    }

    Ok(Overview {
        current_a: int(lines[3], "current")? as f64 / 100.0,
        voltage_v: int(lines[4], "voltage")? as f64 / 10.0,
        power_w: int(lines[5], "power")? as f64,
        power_factor: int(lines[6], "power factor")? as f64 / 1000.0,
        energy_kwh: int(lines[7], "energy")? as f64 / 100.0,
    })
}

/// Decodes `outlet.cgi`. 20-outlet units have one header line fewer.
///
/// Broken blocks are skipped without shifting the index of later outlets;
/// a body where no block decodes is an error.
pub fn parse_outlets(body: &str, outlet_count: usize) -> Result<Vec<OutletReading>> {
    let lines = lines(body);
    let data_start = if outlet_count == 20 { 3 } else { 4 };
    if lines.len() <= data_start + 1 {
        return Err(PduError::Decode(format!(
            "outlet status has only {} lines",
            lines.len()
        )));
    }

    let data = &lines[data_start..lines.len() - 1];
    let mut outlets = Vec::new();
    for (pos, chunk) in data.chunks(OUTLET_CHUNK).enumerate() {
        let index = pos + 1;
        if index > outlet_count {
            break;
        }
        match parse_outlet_chunk(index, chunk) {
            Ok(reading) => outlets.push(reading),
            Err(e) => warn!("Skipping outlet {} block: {}", index, e),
        }
    }

    if outlets.is_empty() {
        return Err(PduError::Decode("no outlet block could be decoded".to_string()));
    }
    Ok(outlets)
}

fn parse_outlet_chunk(index: usize, chunk: &[&str]) -> Result<OutletReading> {
    let state = int(line(chunk, 1, "state")?, "state")?;
    // Limits are optional on older firmware
    let limit = |idx: usize| {
        chunk
            .get(idx)
            .and_then(|l| int(l, "limit").ok())
            .map(|v| v as f64 / 100.0)
    };

    Ok(OutletReading {
        index,
        name: line(chunk, 0, "name")?.trim().to_string(),
        is_on: state == 0,
        current_a: int(line(chunk, 2, "current")?, "current")? as f64 / 100.0,
        power_w: int(line(chunk, 3, "power")?, "power")? as f64,
        current_min_a: limit(4),
        current_max_a: limit(5),
    })
}

fn energy_window(parts: &[&str]) -> Result<EnergyWindow> {
    if parts.len() < 3 {
        return Err(PduError::Decode(format!("energy row too short: {:?}", parts)));
    }
    Ok(EnergyWindow {
        start_kwh: int(parts[0], "energy start")? as f64 / 100.0,
        end_kwh: int(parts[1], "energy end")? as f64 / 100.0,
        today_kwh: int(parts[2], "energy today")? as f64 / 100.0,
    })
}

pub fn parse_daily_energy(body: &str) -> Result<DailyEnergy> {
    let lines = lines(body);
    if lines.len() < ENERGY_MIN_LINES {
        return Err(PduError::Decode(format!(
            "daily energy has {} lines",
            lines.len()
        )));
    }

    let total_parts: Vec<&str> = lines[3].split(',').collect();
    let total = energy_window(&total_parts)?;

    let mut outlets = Vec::new();
    let end = lines.len().saturating_sub(1).max(4);
    for row in &lines[4..end] {
        let parts: Vec<&str> = row.split(',').collect();
        match parts.split_first() {
            Some((name, rest)) => match energy_window(rest) {
                Ok(window) => outlets.push(OutletDailyEnergy {
                    name: name.trim().to_string(),
                    window,
                }),
                Err(e) => warn!("Skipping daily energy row {:?}: {}", row, e),
            },
            None => continue,
        }
    }

    Ok(DailyEnergy { total, outlets })
}

pub fn parse_outlet_energy(body: &str) -> Result<Vec<OutletEnergy>> {
    let lines = lines(body);
    if lines.len() < ENERGY_MIN_LINES {
        return Err(PduError::Decode(format!(
            "outlet energy has {} lines",
            lines.len()
        )));
    }

    let mut result = Vec::new();
    for pair in lines[3..].chunks_exact(2) {
        match int(pair[1], "outlet energy") {
            Ok(value) => result.push(OutletEnergy {
                name: pair[0].trim().trim_end_matches('d').trim().to_string(),
                energy_kwh: value as f64 / 100.0,
            }),
            Err(e) => warn!("Skipping outlet energy pair {:?}: {}", pair, e),
        }
    }
    Ok(result)
}

/// True when a command response reports success (the firmware misspells it sometimes).
pub fn is_command_success(body: &str) -> bool {
    SUCCESS_MARKERS.iter().any(|m| body.contains(m))
}

/// Form fields for switching one outlet through `POST /outlet.cgi`.
pub fn outlet_command_form(index: usize, is_on: bool) -> Vec<(String, String)> {
    let idx = if is_on { 0 } else { 1 };
    vec![
        ("pdu_index".to_string(), "0".to_string()),
        ("idx".to_string(), idx.to_string()),
        (format!("t{:02}", index.saturating_sub(1)), "1".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outlet_body(count: usize, header_lines: usize, states: &[usize]) -> String {
        let mut lines: Vec<String> = (0..header_lines).map(|i| format!("{}d", i)).collect();
        for i in 0..count {
            lines.push(format!("Outlet{}", i + 1));
            lines.push(format!("{}d", states.get(i).copied().unwrap_or(1)));
            lines.push(format!("{}d", 25 * (i + 1)));
            lines.push(format!("{}d", 10 * (i + 1)));
            lines.push("0d".to_string());
            lines.push("1000d".to_string());
            for _ in 0..5 {
                lines.push("0d".to_string());
            }
        }
        lines.push("end".to_string());
        lines.join("\n")
    }

    #[test]
    fn overview_scaling() {
        let body = "0d\n1d\n2d\n320d\n2201d\n700d\n985d\n123456d\n";
        let overview = parse_overview(body).unwrap();
        assert_eq!(overview.current_a, 3.2);
        assert_eq!(overview.voltage_v, 220.1);
        assert_eq!(overview.power_w, 700.0);
        assert_eq!(overview.power_factor, 0.985);
        assert_eq!(overview.energy_kwh, 1234.56);
    }

    #[test]
    fn overview_too_short_is_decode_error() {
        assert!(matches!(parse_overview("1d\n2d\n3d"), Err(PduError::Decode(_))));
        assert!(matches!(
            parse_overview("0\n1\n2\nx\n2201d\n700d\n985d\n1d"),
            Err(PduError::Decode(_))
        ));
    }

    #[test]
    fn sixteen_outlet_status() {
        let body = outlet_body(16, 4, &[0, 1, 0]);
        let outlets = parse_outlets(&body, 16).unwrap();
        assert_eq!(outlets.len(), 16);
        assert_eq!(outlets[0].name, "Outlet1");
        assert!(outlets[0].is_on);
        assert!(!outlets[1].is_on);
        assert!(outlets[2].is_on);
        assert_eq!(outlets[1].current_a, 0.5);
        assert_eq!(outlets[1].power_w, 20.0);
        assert_eq!(outlets[15].index, 16);
        assert_eq!(outlets[15].current_max_a, Some(10.0));
    }

    #[test]
    fn twenty_outlet_header_is_shorter() {
        let body = outlet_body(20, 3, &[]);
        let outlets = parse_outlets(&body, 20).unwrap();
        assert_eq!(outlets.len(), 20);
        assert_eq!(outlets[19].name, "Outlet20");
    }

    #[test]
    fn broken_block_keeps_indices() {
        let body = outlet_body(3, 4, &[0, 0, 0]).replace("Outlet2\n0d", "Outlet2\nxx");
        let outlets = parse_outlets(&body, 3).unwrap();
        let indices: Vec<usize> = outlets.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[test]
    fn daily_energy_rows() {
        let body = "a\nb\nc\n100d,350d,250d\nOutlet1,10d,30d,20d\nOutlet2,bad\nend";
        let daily = parse_daily_energy(body).unwrap();
        assert_eq!(daily.total.today_kwh, 2.5);
        assert_eq!(daily.total.end_kwh, 3.5);
        assert_eq!(daily.outlets.len(), 1);
        assert_eq!(daily.outlets[0].window.today_kwh, 0.2);
    }

    #[test]
    fn outlet_energy_pairs() {
        let body = "x\ny\n2d\nOutlet1d\n608d\nOutlet2d\n15d\n";
        let energy = parse_outlet_energy(body).unwrap();
        assert_eq!(
            energy,
            vec![
                OutletEnergy {
                    name: "Outlet1".into(),
                    energy_kwh: 6.08
                },
                OutletEnergy {
                    name: "Outlet2".into(),
                    energy_kwh: 0.15
                },
            ]
        );
    }

    #[test]
    fn command_form_and_success() {
        let form = outlet_command_form(3, true);
        assert!(form.contains(&("idx".to_string(), "0".to_string())));
        assert!(form.contains(&("t02".to_string(), "1".to_string())));
        let form = outlet_command_form(12, false);
        assert!(form.contains(&("idx".to_string(), "1".to_string())));
        assert!(form.contains(&("t11".to_string(), "1".to_string())));

        assert!(is_command_success("<html>success</html>"));
        assert!(is_command_success("succesd"));
        assert!(!is_command_success("error"));
    }
}
