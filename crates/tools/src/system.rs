//! The `system_utility` tool: clock, weather, health diagnostics, and the
//! profile-backed location lookup. The only tool exempt from the
//! redundancy guard (its answers legitimately change between calls).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use ghost_domain::chat::ToolDefinition;
use ghost_memory::ProfileStore;
use serde_json::Value;

use crate::tor::{proxied_client, rotate_and_wait};
use crate::{opt_str, require_str, Tool};

const WEATHER_TIMEOUT: Duration = Duration::from_secs(20);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const TOR_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn wmo_condition(code: i64) -> &'static str {
    match code {
        0 => "Clear",
        1 => "Mainly Clear",
        2 => "Partly Cloudy",
        3 => "Overcast",
        45 => "Fog",
        61 => "Rain",
        63 => "Heavy Rain",
        71 => "Snow",
        95 => "Thunderstorm",
        _ => "Variable",
    }
}

/// Scheduler visibility for the health report.
pub trait SchedulerProbe: Send + Sync {
    fn job_count(&self) -> usize;
}

pub struct SystemUtilityTool {
    pub tor_proxy: Option<String>,
    pub profile: Option<Arc<ProfileStore>>,
    pub memory_active: bool,
    pub scheduler: Option<Arc<dyn SchedulerProbe>>,
}

impl SystemUtilityTool {
    async fn check_time(&self) -> String {
        let now = Local::now();
        format!(
            "Current System Time: {} (Day: {})",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.format("%A")
        )
    }

    async fn check_location(&self) -> String {
        match self.profile.as_ref().and_then(|p| p.find_location()) {
            Some(loc) => format!("User Location: {loc}"),
            None => "User Location: Unknown (Profile has no location data).".into(),
        }
    }

    async fn check_weather(&self, location: Option<&str>) -> String {
        let location = match location.filter(|l| !l.trim().is_empty()) {
            Some(l) => l.to_string(),
            None => match self.profile.as_ref().and_then(|p| p.find_location()) {
                Some(l) => {
                    tracing::info!(location = %l, "weather using profile location");
                    l
                }
                None => {
                    return "SYSTEM ERROR: No location provided. You MUST specify a city \
                            (e.g., 'London') or update your profile."
                        .into();
                }
            },
        };

        let via_tor = self.tor_proxy.is_some();
        let client = proxied_client(self.tor_proxy.as_deref(), WEATHER_TIMEOUT);

        // Primary source: Open-Meteo geocoding + forecast.
        let mut last_error = String::new();
        for _attempt in 0..3 {
            match self.open_meteo(&client, &location).await {
                Ok(Some(report)) => return report,
                Ok(None) => break,
                Err((retryable, e)) => {
                    last_error = e;
                    if retryable && via_tor {
                        rotate_and_wait().await;
                        continue;
                    }
                    break;
                }
            }
        }
        tracing::warn!(error = %last_error, "open-meteo failed, trying wttr.in");

        // Fallback: wttr.in one-liner.
        for _attempt in 0..3 {
            let url = format!("https://wttr.in/{}?format=3", urlencode(&location));
            match client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if matches!(status, 401 | 403 | 503) && via_tor {
                        rotate_and_wait().await;
                        continue;
                    }
                    if status == 200 {
                        if let Ok(text) = resp.text().await {
                            if !text.to_lowercase().contains("<html") {
                                return format!("REPORT (Source: wttr.in): {}", text.trim());
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    last_error = e.to_string();
                    if via_tor {
                        rotate_and_wait().await;
                        continue;
                    }
                    break;
                }
            }
        }

        "SYSTEM ERROR: Connection failed to all weather providers.".into()
    }

    /// One Open-Meteo round trip. `Err((retryable, msg))` distinguishes
    /// block-status retries from terminal failures; `Ok(None)` means the
    /// location was not found.
    async fn open_meteo(
        &self,
        client: &reqwest::Client,
        location: &str,
    ) -> std::result::Result<Option<String>, (bool, String)> {
        let geo_url = format!(
            "https://geocoding-api.open-meteo.com/v1/search?name={}&count=1&language=en&format=json",
            urlencode(location)
        );
        let geo = client
            .get(&geo_url)
            .send()
            .await
            .map_err(|e| (true, e.to_string()))?;
        let status = geo.status().as_u16();
        if matches!(status, 401 | 403 | 503) {
            return Err((true, format!("geocoding blocked: HTTP {status}")));
        }
        if status != 200 {
            return Err((false, format!("geocoding failed: HTTP {status}")));
        }
        let geo: Value = geo.json().await.map_err(|e| (true, e.to_string()))?;
        let Some(place) = geo.get("results").and_then(|r| r.as_array()).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        let (lat, lon) = (
            place.get("latitude").and_then(|v| v.as_f64()).unwrap_or(0.0),
            place.get("longitude").and_then(|v| v.as_f64()).unwrap_or(0.0),
        );
        let name = place.get("name").and_then(|v| v.as_str()).unwrap_or(location);

        let forecast_url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={lat}&longitude={lon}&current=temperature_2m,relative_humidity_2m,weather_code,wind_speed_10m&wind_speed_unit=kmh"
        );
        let weather = client
            .get(&forecast_url)
            .send()
            .await
            .map_err(|e| (true, e.to_string()))?;
        let status = weather.status().as_u16();
        if matches!(status, 401 | 403 | 503) {
            return Err((true, format!("forecast blocked: HTTP {status}")));
        }
        if status != 200 {
            return Err((false, format!("forecast failed: HTTP {status}")));
        }
        let weather: Value = weather.json().await.map_err(|e| (true, e.to_string()))?;
        let current = weather.get("current").cloned().unwrap_or_default();

        Ok(Some(format!(
            "REPORT (Source: Open-Meteo): Weather in {name}\nCondition: {}\nTemp: {}°C\nWind: {} km/h\nHumidity: {}%",
            wmo_condition(current.get("weather_code").and_then(|v| v.as_i64()).unwrap_or(-1)),
            current.get("temperature_2m").and_then(|v| v.as_f64()).unwrap_or(0.0),
            current.get("wind_speed_10m").and_then(|v| v.as_f64()).unwrap_or(0.0),
            current.get("relative_humidity_2m").and_then(|v| v.as_i64()).unwrap_or(0),
        )))
    }

    async fn check_health(&self) -> String {
        let mut report = vec!["System Status: Online".to_string()];

        report.push(format!(
            "OS: {} ({})",
            std::env::consts::OS,
            std::env::consts::ARCH
        ));

        if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
            let fields: Vec<&str> = loadavg.split_whitespace().take(3).collect();
            if fields.len() == 3 {
                report.push(format!(
                    "CPU Load (1/5/15 min): {} / {} / {}",
                    fields[0], fields[1], fields[2]
                ));
            }
        }
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            let get_kb = |key: &str| -> Option<u64> {
                meminfo
                    .lines()
                    .find(|l| l.starts_with(key))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse().ok())
            };
            if let (Some(total), Some(avail)) = (get_kb("MemTotal:"), get_kb("MemAvailable:")) {
                let used = total.saturating_sub(avail);
                report.push(format!(
                    "Memory: {:.0}% used ({}MB / {}MB)",
                    used as f64 / total as f64 * 100.0,
                    used / 1024,
                    total / 1024
                ));
            }
        }

        // Connectivity probe, via the proxy when one is configured.
        let probe = proxied_client(self.tor_proxy.as_deref(), PROBE_TIMEOUT);
        match probe.get("https://1.1.1.1").send().await {
            Ok(resp) => {
                let mut line = format!("Internet: Connected ({})", resp.status().as_u16());
                if self.tor_proxy.is_some() {
                    line.push_str(" [via Tor]");
                }
                report.push(line);
            }
            Err(_) => report.push("Internet: Disconnected or Blocked".into()),
        }

        if self.tor_proxy.is_some() {
            let tor_probe = proxied_client(self.tor_proxy.as_deref(), TOR_PROBE_TIMEOUT);
            let mut verdict = "Tor: Connection Failed".to_string();
            for attempt in 0..3 {
                match tor_probe
                    .get("https://check.torproject.org/api/ip")
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().as_u16() == 200 => {
                        let is_tor = resp
                            .json::<Value>()
                            .await
                            .ok()
                            .and_then(|v| v.get("IsTor").and_then(|b| b.as_bool()))
                            .unwrap_or(false);
                        verdict = if is_tor {
                            "Tor: Connected (Anonymous)".into()
                        } else {
                            "Tor: Connected but Not Anonymous (Check Config)".into()
                        };
                        break;
                    }
                    _ if attempt < 2 => rotate_and_wait().await,
                    _ => {}
                }
            }
            report.push(verdict);
        } else {
            report.push("Tor: Not Configured".into());
        }

        let sched = match &self.scheduler {
            Some(probe) => format!("Running ({} jobs)", probe.job_count()),
            None => "Stopped".into(),
        };
        report.push(format!(
            "Agent Internals: Memory={}, Scheduler={}",
            if self.memory_active { "Active" } else { "Offline" },
            sched
        ));

        report.join("\n")
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .flat_map(|c| {
            if c.is_ascii_alphanumeric() || "-_.~".contains(c) {
                vec![c.to_string()]
            } else {
                c.to_string()
                    .into_bytes()
                    .iter()
                    .map(|b| format!("%{b:02X}"))
                    .collect()
            }
        })
        .collect()
}

#[async_trait]
impl Tool for SystemUtilityTool {
    fn name(&self) -> &'static str {
        "system_utility"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "system_utility".into(),
            description: "MANDATORY for Real-Time Data. Use this to check the current time, \
                          perform DIAGNOSTICS/FULL HEALTH CHECK, get user location, or get the \
                          weather. You DO NOT have access to these values without this tool."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["check_time", "check_weather", "check_health", "check_location"]
                    },
                    "location": {
                        "type": "string",
                        "description": "Required ONLY for 'check_weather'. City name (e.g., \
                                        'Paris'). Leave empty for local weather."
                    }
                },
                "required": ["action"]
            }),
        }
    }

    async fn run(&self, args: Value) -> String {
        let action = match require_str(&args, "action") {
            Ok(a) => a,
            Err(e) => return e,
        };
        match action {
            "check_time" => self.check_time().await,
            "check_weather" => self.check_weather(opt_str(&args, "location")).await,
            "check_health" => self.check_health().await,
            "check_location" => self.check_location().await,
            other => format!("Error: Unknown action '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> SystemUtilityTool {
        SystemUtilityTool {
            tor_proxy: None,
            profile: None,
            memory_active: false,
            scheduler: None,
        }
    }

    #[tokio::test]
    async fn check_time_reports_day() {
        let out = tool().check_time().await;
        assert!(out.starts_with("Current System Time:"));
        assert!(out.contains("(Day: "));
    }

    #[tokio::test]
    async fn weather_without_location_or_profile_errors() {
        let out = tool().check_weather(None).await;
        assert!(out.starts_with("SYSTEM ERROR: No location provided"));
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let out = tool().run(serde_json::json!({"action": "levitate"})).await;
        assert_eq!(out, "Error: Unknown action 'levitate'");
    }

    #[test]
    fn urlencode_basic() {
        assert_eq!(urlencode("New York"), "New%20York");
        assert_eq!(urlencode("Athens"), "Athens");
    }

    #[test]
    fn wmo_mapping() {
        assert_eq!(wmo_condition(0), "Clear");
        assert_eq!(wmo_condition(95), "Thunderstorm");
        assert_eq!(wmo_condition(42), "Variable");
    }
}
