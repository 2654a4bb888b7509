use sentinel_proto::StatusSnapshot;

pub const MAINTENANCE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Service unavailable</title></head>
<body>
<h1>Backend unavailable</h1>
<p>This service is temporarily in maintenance mode while the backend recovers.</p>
<p>Please retry shortly.</p>
</body>
</html>
"#;

/// Renders the live status page served at `/sentinel` on the maintenance
/// listeners, from the same `StatusSnapshot` the JSON `/status` endpoint
/// returns.
pub fn render_status_html(snapshot: &StatusSnapshot) -> String {
    let outage = match (snapshot.outage_start, snapshot.outage_seconds) {
        (Some(start), Some(seconds)) => format!("since {start} ({seconds}s)"),
        _ => "none".to_string(),
    };
    let last_preemption = snapshot
        .last_preemption
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>sentinel status</title></head>
<body>
<h1>Sentinel status</h1>
<table>
<tr><td>Mode</td><td>{mode}</td></tr>
<tr><td>Backend IP</td><td>{backend_ip}</td></tr>
<tr><td>Preempt count</td><td>{preempt_count}</td></tr>
<tr><td>Current outage</td><td>{outage}</td></tr>
<tr><td>Last preemption</td><td>{last_preemption}</td></tr>
<tr><td>Cert sync count</td><td>{cert_synced}</td></tr>
<tr><td>Cert sync last error</td><td>{cert_error}</td></tr>
<tr><td>Key sync count</td><td>{key_synced}</td></tr>
<tr><td>Key sync last error</td><td>{key_error}</td></tr>
</table>
</body>
</html>
"#,
        mode = snapshot.mode,
        backend_ip = snapshot.backend_ip,
        preempt_count = snapshot.preempt_count,
        outage = outage,
        last_preemption = last_preemption,
        cert_synced = snapshot.cert_sync.synced_count,
        cert_error = snapshot
            .cert_sync
            .last_error
            .as_deref()
            .unwrap_or("none"),
        key_synced = snapshot.key_sync.synced_count,
        key_error = snapshot.key_sync.last_error.as_deref().unwrap_or("none"),
    )
}
