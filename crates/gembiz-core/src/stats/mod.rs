//! Request statistics: global, per-model, and per-client-IP aggregators.
//!
//! Each aggregator owns its own lock and is updated exactly once per
//! request from the pipeline's completion hook. Token counts are estimates:
//! `len/4` for text plus 500 per image.

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};

/// Estimate input tokens for a prompt with attached media.
pub fn estimate_input_tokens(text_len: usize, media_count: usize) -> u64 {
    (text_len / 4 + media_count * 500) as u64
}

/// Estimate output tokens from emitted text length.
pub fn estimate_output_tokens(text_len: usize) -> u64 {
    (text_len / 4) as u64
}

/// One request's contribution, recorded once.
#[derive(Debug, Clone, Default)]
pub struct RequestSample {
    pub model: String,
    pub success: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub images: u64,
    pub videos: u64,
}

#[derive(Default, Clone)]
struct ModelStats {
    requests: u64,
    success: u64,
    input_tokens: u64,
    output_tokens: u64,
    images: u64,
}

#[derive(Default, Clone, Copy)]
struct HourlyStats {
    requests: u64,
    success: u64,
    input_tokens: u64,
    output_tokens: u64,
}

struct ApiStatsInner {
    start_time: DateTime<Utc>,
    total_requests: u64,
    success_requests: u64,
    failed_requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    images_generated: u64,
    videos_generated: u64,
    request_times: VecDeque<DateTime<Utc>>,
    model_stats: HashMap<String, ModelStats>,
    hourly: [HourlyStats; 24],
    last_hour: u32,
}

/// Process-wide API statistics plus per-model breakdown.
pub struct ApiStats {
    inner: Mutex<ApiStatsInner>,
}

const MAX_REQUEST_TIMES: usize = 1000;

impl ApiStats {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            inner: Mutex::new(ApiStatsInner {
                start_time: now,
                total_requests: 0,
                success_requests: 0,
                failed_requests: 0,
                input_tokens: 0,
                output_tokens: 0,
                images_generated: 0,
                videos_generated: 0,
                request_times: VecDeque::with_capacity(MAX_REQUEST_TIMES),
                model_stats: HashMap::new(),
                hourly: [HourlyStats::default(); 24],
                last_hour: now.hour(),
            }),
        }
    }

    pub fn record(&self, sample: &RequestSample) {
        self.record_at(sample, Utc::now());
    }

    fn record_at(&self, sample: &RequestSample, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        if sample.success {
            inner.success_requests += 1;
        } else {
            inner.failed_requests += 1;
        }
        inner.input_tokens += sample.input_tokens;
        inner.output_tokens += sample.output_tokens;
        inner.images_generated += sample.images;
        inner.videos_generated += sample.videos;

        if inner.request_times.len() >= MAX_REQUEST_TIMES {
            inner.request_times.pop_front();
        }
        inner.request_times.push_back(now);

        if !sample.model.is_empty() {
            let entry = inner.model_stats.entry(sample.model.clone()).or_default();
            entry.requests += 1;
            if sample.success {
                entry.success += 1;
            }
            entry.input_tokens += sample.input_tokens;
            entry.output_tokens += sample.output_tokens;
            entry.images += sample.images;
        }

        let hour = now.hour();
        if hour != inner.last_hour {
            inner.hourly[hour as usize] = HourlyStats::default();
            inner.last_hour = hour;
        }
        let bucket = &mut inner.hourly[hour as usize];
        bucket.requests += 1;
        if sample.success {
            bucket.success += 1;
        }
        bucket.input_tokens += sample.input_tokens;
        bucket.output_tokens += sample.output_tokens;
    }

    /// Requests in the trailing minute.
    pub fn rpm(&self) -> u64 {
        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        let inner = self.inner.lock();
        inner.request_times.iter().rev().take_while(|t| **t > cutoff).count() as u64
    }

    pub fn stats(&self) -> Value {
        let rpm = self.rpm();
        let inner = self.inner.lock();
        let uptime = Utc::now() - inner.start_time;
        let uptime_min = (uptime.num_seconds() as f64 / 60.0).max(f64::MIN_POSITIVE);
        json!({
            "uptime_seconds": uptime.num_seconds(),
            "total_requests": inner.total_requests,
            "success_requests": inner.success_requests,
            "failed_requests": inner.failed_requests,
            "success_rate": format!(
                "{:.2}%",
                inner.success_requests as f64 / (inner.total_requests.max(1)) as f64 * 100.0
            ),
            "input_tokens": inner.input_tokens,
            "output_tokens": inner.output_tokens,
            "total_tokens": inner.input_tokens + inner.output_tokens,
            "images_generated": inner.images_generated,
            "videos_generated": inner.videos_generated,
            "current_rpm": rpm,
            "average_rpm": format!("{:.2}", inner.total_requests as f64 / uptime_min),
        })
    }

    pub fn detailed_stats(&self) -> Value {
        let mut value = self.stats();
        let inner = self.inner.lock();
        let models: serde_json::Map<String, Value> = inner
            .model_stats
            .iter()
            .map(|(model, ms)| {
                (
                    model.clone(),
                    json!({
                        "requests": ms.requests,
                        "success": ms.success,
                        "success_rate": format!(
                            "{:.2}%",
                            ms.success as f64 / ms.requests.max(1) as f64 * 100.0
                        ),
                        "input_tokens": ms.input_tokens,
                        "output_tokens": ms.output_tokens,
                        "total_tokens": ms.input_tokens + ms.output_tokens,
                        "images": ms.images,
                    }),
                )
            })
            .collect();
        let hourly: Vec<Value> = inner
            .hourly
            .iter()
            .enumerate()
            .filter(|(_, h)| h.requests > 0)
            .map(|(hour, h)| {
                json!({
                    "hour": hour,
                    "requests": h.requests,
                    "success": h.success,
                    "input_tokens": h.input_tokens,
                    "output_tokens": h.output_tokens,
                })
            })
            .collect();
        value["models"] = Value::Object(models);
        value["hourly"] = Value::Array(hourly);
        value
    }
}

impl Default for ApiStats {
    fn default() -> Self {
        Self::new()
    }
}

struct IpRecord {
    total: u64,
    success: u64,
    failed: u64,
    input_tokens: u64,
    output_tokens: u64,
    images: u64,
    videos: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    request_times: VecDeque<DateTime<Utc>>,
    models: HashMap<String, u64>,
    user_agents: HashMap<String, u64>,
}

/// Per-client-IP statistics.
pub struct IpStats {
    inner: Mutex<HashMap<String, IpRecord>>,
}

const MAX_IP_REQUEST_TIMES: usize = 100;
const MAX_USER_AGENTS: usize = 50;

impl IpStats {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub fn record(&self, ip: &str, user_agent: &str, sample: &RequestSample) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = inner.entry(ip.to_string()).or_insert_with(|| IpRecord {
            total: 0,
            success: 0,
            failed: 0,
            input_tokens: 0,
            output_tokens: 0,
            images: 0,
            videos: 0,
            first_seen: now,
            last_seen: now,
            request_times: VecDeque::with_capacity(MAX_IP_REQUEST_TIMES),
            models: HashMap::new(),
            user_agents: HashMap::new(),
        });
        record.total += 1;
        record.last_seen = now;
        record.input_tokens += sample.input_tokens;
        record.output_tokens += sample.output_tokens;
        record.images += sample.images;
        record.videos += sample.videos;
        if record.request_times.len() >= MAX_IP_REQUEST_TIMES {
            record.request_times.pop_front();
        }
        record.request_times.push_back(now);
        if sample.success {
            record.success += 1;
        } else {
            record.failed += 1;
        }
        if !sample.model.is_empty() {
            *record.models.entry(sample.model.clone()).or_default() += 1;
        }
        if !user_agent.is_empty() && record.user_agents.len() < MAX_USER_AGENTS {
            *record.user_agents.entry(user_agent.to_string()).or_default() += 1;
        }
    }

    pub fn all(&self) -> Value {
        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        let inner = self.inner.lock();
        let mut rows: Vec<(&String, &IpRecord)> = inner.iter().collect();
        rows.sort_by(|a, b| b.1.total.cmp(&a.1.total));

        let mut totals = (0u64, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64);
        let ips: Vec<Value> = rows
            .iter()
            .map(|(ip, rec)| {
                let rpm =
                    rec.request_times.iter().rev().take_while(|t| **t > cutoff).count() as u64;
                totals.0 += rec.total;
                totals.1 += rec.success;
                totals.2 += rec.failed;
                totals.3 += rec.input_tokens;
                totals.4 += rec.output_tokens;
                totals.5 += rec.images;
                totals.6 += rec.videos;
                json!({
                    "ip": ip,
                    "total_count": rec.total,
                    "success_count": rec.success,
                    "failed_count": rec.failed,
                    "success_rate": format!(
                        "{:.1}%",
                        rec.success as f64 / rec.total.max(1) as f64 * 100.0
                    ),
                    "input_tokens": rec.input_tokens,
                    "output_tokens": rec.output_tokens,
                    "total_tokens": rec.input_tokens + rec.output_tokens,
                    "images": rec.images,
                    "videos": rec.videos,
                    "rpm": rpm,
                    "first_seen": rec.first_seen.to_rfc3339(),
                    "last_seen": rec.last_seen.to_rfc3339(),
                    "models": rec.models,
                    "user_agents": rec.user_agents,
                })
            })
            .collect();

        json!({
            "server_time": Utc::now().to_rfc3339(),
            "unique_ips": ips.len(),
            "total_requests": totals.0,
            "total_success": totals.1,
            "total_failed": totals.2,
            "total_input_tokens": totals.3,
            "total_output_tokens": totals.4,
            "total_tokens": totals.3 + totals.4,
            "total_images": totals.5,
            "total_videos": totals.6,
            "ips": ips,
        })
    }
}

impl Default for IpStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(model: &str, success: bool) -> RequestSample {
        RequestSample {
            model: model.to_string(),
            success,
            input_tokens: 100,
            output_tokens: 25,
            images: 1,
            videos: 0,
        }
    }

    #[test]
    fn token_estimates() {
        assert_eq!(estimate_input_tokens(400, 2), 1100);
        assert_eq!(estimate_output_tokens(399), 99);
    }

    #[test]
    fn records_totals_and_model_breakdown() {
        let stats = ApiStats::new();
        stats.record(&sample("gemini-2.5-flash", true));
        stats.record(&sample("gemini-2.5-flash", false));
        let detailed = stats.detailed_stats();
        assert_eq!(detailed["total_requests"], 2);
        assert_eq!(detailed["success_requests"], 1);
        assert_eq!(detailed["models"]["gemini-2.5-flash"]["requests"], 2);
        assert_eq!(detailed["input_tokens"], 200);
    }

    #[test]
    fn rpm_counts_only_recent_requests() {
        let stats = ApiStats::new();
        let old = Utc::now() - chrono::Duration::minutes(5);
        stats.record_at(&sample("m", true), old);
        stats.record_at(&sample("m", true), Utc::now());
        assert_eq!(stats.rpm(), 1);
    }

    #[test]
    fn ip_stats_track_models_and_user_agents() {
        let stats = IpStats::new();
        stats.record("10.0.0.1", "curl/8", &sample("m1", true));
        stats.record("10.0.0.1", "curl/8", &sample("m1", false));
        stats.record("10.0.0.2", "", &sample("m2", true));
        let all = stats.all();
        assert_eq!(all["unique_ips"], 2);
        assert_eq!(all["total_requests"], 3);
        assert_eq!(all["ips"][0]["ip"], "10.0.0.1");
        assert_eq!(all["ips"][0]["models"]["m1"], 2);
        assert_eq!(all["ips"][0]["user_agents"]["curl/8"], 2);
    }
}
