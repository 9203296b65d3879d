//! Flow definitions: markdown files with YAML front-matter, fired on a cron
//! schedule, optionally gated by a pre-execution script.
//!
//! ```markdown
//! ---
//! name: nightly-triage
//! schedule: "0 3 * * *"
//! agent_profile: developer
//! script: ./check_alerts.sh
//! ---
//!
//! Investigate the elevated error rate on [[url]] (status [[status_code]]).
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
};

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ErrorKind, OrchestratorError},
    provider::ProviderKind,
};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([A-Za-z0-9_]+)\]\]").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("failed to access flow file: {0}")]
    Io(#[from] std::io::Error),
    #[error("flow file must start with a '---' front-matter block")]
    MissingFrontMatter,
    #[error("invalid front-matter: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid provider in flow: {0}")]
    Provider(String),
    #[error("invalid cron expression '{spec}': {reason}")]
    Cron { spec: String, reason: String },
    #[error("flow script failed: {0}")]
    Script(String),
}

impl From<FlowError> for OrchestratorError {
    fn from(err: FlowError) -> Self {
        let kind = match &err {
            FlowError::Script(_) => ErrorKind::ScriptFailure,
            FlowError::Io(_) => ErrorKind::Internal,
            _ => ErrorKind::InvalidRequest,
        };
        OrchestratorError::new(kind, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct FlowFrontMatter {
    name: String,
    schedule: String,
    agent_profile: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    script: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub name: String,
    pub schedule: String,
    pub agent_profile: String,
    pub provider: Option<ProviderKind>,
    pub script: Option<PathBuf>,
    pub enabled: bool,
    pub prompt_template: String,
    /// The file content exactly as posted; round-trips bit-identically.
    pub raw: String,
}

/// Split a markdown document into its front-matter and body. The opening
/// `---` must be the first line; the closing one is the next line equal to
/// `---`.
pub(crate) fn split_front_matter(content: &str) -> Result<(&str, &str), FlowError> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
        .ok_or(FlowError::MissingFrontMatter)?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((front, body));
        }
        offset += line.len();
    }
    Err(FlowError::MissingFrontMatter)
}

pub fn parse_flow(content: &str) -> Result<FlowDefinition, FlowError> {
    let (front, body) = split_front_matter(content)?;
    let meta: FlowFrontMatter = serde_yaml::from_str(front)?;
    let provider = meta
        .provider
        .as_deref()
        .map(ProviderKind::from_str)
        .transpose()
        .map_err(FlowError::Provider)?;

    // Validate the schedule up front so a bad flow is rejected at add time,
    // not at the first tick.
    cron_schedule(&meta.schedule)?;

    Ok(FlowDefinition {
        name: meta.name,
        schedule: meta.schedule,
        agent_profile: meta.agent_profile,
        provider,
        script: meta.script,
        enabled: meta.enabled,
        prompt_template: body.trim_start_matches('\n').to_string(),
        raw: content.to_string(),
    })
}

/// Parse a five- or six-field cron expression. Five-field specs get a zero
/// seconds column prepended (the `cron` crate wants six or seven fields).
pub fn cron_schedule(spec: &str) -> Result<Schedule, FlowError> {
    let fields = spec.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| FlowError::Cron {
        spec: spec.to_string(),
        reason: e.to_string(),
    })
}

/// First occurrence strictly after `now`. Missed firings collapse: callers
/// always advance from the current time, never from the missed slot.
pub fn next_fire_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

/// Substitute `[[key]]` placeholders. Missing keys become empty strings.
pub fn interpolate(template: &str, values: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            values.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Verdict of a flow's pre-execution script.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptGate {
    pub execute: bool,
    #[serde(default)]
    pub output: HashMap<String, String>,
}

/// Run the pre-script and parse its stdout. Non-zero exit or malformed
/// output suppresses the firing.
pub async fn run_script(path: &Path) -> Result<ScriptGate, FlowError> {
    let output = tokio::process::Command::new(path)
        .output()
        .await
        .map_err(|e| FlowError::Script(format!("failed to execute {}: {e}", path.display())))?;
    if !output.status.success() {
        return Err(FlowError::Script(format!(
            "{} exited with {}",
            path.display(),
            output.status
        )));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|e| FlowError::Script(format!("unparseable script output: {e}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub name: String,
    pub schedule: String,
    pub agent_profile: String,
    pub provider: Option<ProviderKind>,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct FlowEntry {
    def: FlowDefinition,
    next_fire_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// On-disk flow store: one markdown file per flow under `dir`. The in-memory
/// view is rebuilt on reload; `next_fire_at` is always recomputed from the
/// current time.
pub struct FlowStore {
    dir: PathBuf,
    inner: Mutex<HashMap<String, FlowEntry>>,
}

impl FlowStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FlowError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            inner: Mutex::new(HashMap::new()),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn reload(&self) -> Result<(), FlowError> {
        let mut entries = HashMap::new();
        let now = Utc::now();
        for dirent in std::fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            match parse_flow(&content) {
                Ok(def) => {
                    let next = self.initial_fire(&def, now);
                    entries.insert(
                        def.name.clone(),
                        FlowEntry {
                            def,
                            next_fire_at: next,
                            last_error: None,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target = "cao::flow",
                        file = %path.display(),
                        error = %err,
                        "skipping unparseable flow file"
                    );
                }
            }
        }
        *self.inner.lock() = entries;
        Ok(())
    }

    fn initial_fire(&self, def: &FlowDefinition, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !def.enabled {
            return None;
        }
        cron_schedule(&def.schedule)
            .ok()
            .and_then(|s| next_fire_after(&s, now))
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.md"))
    }

    /// Persist a flow file and register it. Re-posting an existing name
    /// replaces the definition.
    pub fn add(&self, content: &str) -> Result<String, FlowError> {
        let def = parse_flow(content)?;
        std::fs::write(self.path_for(&def.name), content)?;
        let name = def.name.clone();
        let next = self.initial_fire(&def, Utc::now());
        self.inner.lock().insert(
            name.clone(),
            FlowEntry {
                def,
                next_fire_at: next,
                last_error: None,
            },
        );
        tracing::info!(target = "cao::flow", flow = %name, "registered flow");
        Ok(name)
    }

    pub fn get(&self, name: &str) -> Result<FlowDefinition, OrchestratorError> {
        self.inner
            .lock()
            .get(name)
            .map(|entry| entry.def.clone())
            .ok_or_else(|| OrchestratorError::not_found(format!("flow '{name}'")))
    }

    /// The flow file exactly as posted.
    pub fn raw(&self, name: &str) -> Result<String, OrchestratorError> {
        self.get(name).map(|def| def.raw)
    }

    pub fn list(&self) -> Vec<FlowSummary> {
        let inner = self.inner.lock();
        let mut all: Vec<FlowSummary> = inner
            .values()
            .map(|entry| FlowSummary {
                name: entry.def.name.clone(),
                schedule: entry.def.schedule.clone(),
                agent_profile: entry.def.agent_profile.clone(),
                provider: entry.def.provider,
                enabled: entry.def.enabled,
                next_fire_at: entry.next_fire_at,
                last_error: entry.last_error.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Enable or disable a flow. Rewrites only the `enabled:` line of the
    /// front-matter so the rest of the file stays byte-identical. Idempotent.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), OrchestratorError> {
        let raw = self.raw(name)?;
        let updated =
            rewrite_enabled(&raw, enabled).map_err(OrchestratorError::from)?;
        std::fs::write(self.path_for(name), &updated)
            .map_err(|e| OrchestratorError::internal(e.to_string()))?;

        let def = parse_flow(&updated).map_err(OrchestratorError::from)?;
        let next = self.initial_fire(&def, Utc::now());
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(name) {
            entry.def = def;
            entry.next_fire_at = next;
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), OrchestratorError> {
        let removed = self.inner.lock().remove(name);
        if removed.is_none() {
            return Err(OrchestratorError::not_found(format!("flow '{name}'")));
        }
        let _ = std::fs::remove_file(self.path_for(name));
        tracing::info!(target = "cao::flow", flow = %name, "removed flow");
        Ok(())
    }

    /// Enabled flows whose fire time has arrived.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<FlowDefinition> {
        self.inner
            .lock()
            .values()
            .filter(|entry| {
                entry.def.enabled && entry.next_fire_at.is_some_and(|at| at <= now)
            })
            .map(|entry| entry.def.clone())
            .collect()
    }

    /// Advance a flow's `next_fire_at` to the first occurrence strictly
    /// after `now`.
    pub fn advance(&self, name: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(name) {
            entry.next_fire_at = cron_schedule(&entry.def.schedule)
                .ok()
                .and_then(|s| next_fire_after(&s, now));
        }
    }

    pub fn record_error(&self, name: &str, message: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(name) {
            entry.last_error = Some(message.to_string());
        }
    }

    pub fn next_fire_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().get(name).and_then(|e| e.next_fire_at)
    }
}

/// Replace (or insert) the `enabled:` key inside the front-matter block,
/// leaving every other byte untouched.
fn rewrite_enabled(raw: &str, enabled: bool) -> Result<String, FlowError> {
    let (front, _) = split_front_matter(raw)?;
    let front_start = if raw.starts_with("---\r\n") { 5 } else { 4 };
    let mut new_front = String::with_capacity(front.len() + 16);
    let mut replaced = false;
    for line in front.split_inclusive('\n') {
        if line.trim_start().starts_with("enabled:") {
            new_front.push_str(&format!("enabled: {enabled}\n"));
            replaced = true;
        } else {
            new_front.push_str(line);
        }
    }
    if !replaced {
        if !new_front.ends_with('\n') && !new_front.is_empty() {
            new_front.push('\n');
        }
        new_front.push_str(&format!("enabled: {enabled}\n"));
    }
    let mut result = String::with_capacity(raw.len() + 16);
    result.push_str(&raw[..front_start]);
    result.push_str(&new_front);
    result.push_str(&raw[front_start + front.len()..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use super::{
        cron_schedule, interpolate, next_fire_after, parse_flow, rewrite_enabled, FlowStore,
    };

    const FLOW: &str = "---\nname: nightly-triage\nschedule: \"0 3 * * *\"\nagent_profile: developer\n---\n\nInvestigate [[url]] returning [[status_code]].\n";

    #[test]
    fn parses_front_matter_and_template() {
        let def = parse_flow(FLOW).unwrap();
        assert_eq!(def.name, "nightly-triage");
        assert_eq!(def.agent_profile, "developer");
        assert!(def.enabled);
        assert!(def.provider.is_none());
        assert_eq!(
            def.prompt_template.trim(),
            "Investigate [[url]] returning [[status_code]]."
        );
        assert_eq!(def.raw, FLOW);
    }

    #[test]
    fn rejects_file_without_front_matter() {
        assert!(parse_flow("just a prompt\n").is_err());
    }

    #[test]
    fn rejects_bad_cron_spec() {
        let bad = FLOW.replace("0 3 * * *", "often");
        assert!(parse_flow(&bad).is_err());
    }

    #[test]
    fn rejects_unknown_provider() {
        let bad = FLOW.replace(
            "agent_profile: developer",
            "agent_profile: developer\nprovider: cursor",
        );
        assert!(parse_flow(&bad).is_err());
    }

    #[test]
    fn five_field_cron_gets_seconds_prepended() {
        let schedule = cron_schedule("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let next = next_fire_after(&schedule, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn cron_fires_once_per_window() {
        let schedule = cron_schedule("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 2, 30).unwrap();
        let first = next_fire_after(&schedule, now).unwrap();
        let second = next_fire_after(&schedule, first).unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());
        assert_eq!(second - first, chrono::Duration::minutes(5));
    }

    #[test]
    fn six_field_cron_is_accepted_verbatim() {
        assert!(cron_schedule("30 */5 * * * *").is_ok());
    }

    #[test]
    fn interpolation_fills_known_keys_and_blanks_missing_ones() {
        let mut values = HashMap::new();
        values.insert("url".to_string(), "https://svc.internal".to_string());
        let out = interpolate("check [[url]] (code [[status_code]])", &values);
        assert_eq!(out, "check https://svc.internal (code )");
    }

    #[test]
    fn rewrite_enabled_replaces_in_place() {
        let raw = FLOW.replace(
            "agent_profile: developer",
            "agent_profile: developer\nenabled: true",
        );
        let off = rewrite_enabled(&raw, false).unwrap();
        assert!(off.contains("enabled: false"));
        assert_eq!(off.matches("enabled:").count(), 1);
        // Toggling back restores the original bytes.
        assert_eq!(rewrite_enabled(&off, true).unwrap(), raw);
    }

    #[test]
    fn rewrite_enabled_inserts_when_absent() {
        let off = rewrite_enabled(FLOW, false).unwrap();
        assert!(off.contains("enabled: false\n"));
        let def = parse_flow(&off).unwrap();
        assert!(!def.enabled);
        assert_eq!(def.prompt_template, parse_flow(FLOW).unwrap().prompt_template);
    }

    #[test]
    fn store_round_trips_raw_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlowStore::open(dir.path()).unwrap();
        let name = store.add(FLOW).unwrap();
        assert_eq!(store.raw(&name).unwrap(), FLOW);

        // Survives a reload from disk.
        store.reload().unwrap();
        assert_eq!(store.raw(&name).unwrap(), FLOW);
    }

    #[test]
    fn disabled_flows_are_never_due() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlowStore::open(dir.path()).unwrap();
        let every_minute = FLOW.replace("0 3 * * *", "* * * * *");
        let name = store.add(&every_minute).unwrap();

        store.set_enabled(&name, false).unwrap();
        let far_future = Utc::now() + chrono::Duration::days(1);
        assert!(store.due(far_future).is_empty());

        // Idempotent disable.
        store.set_enabled(&name, false).unwrap();
        assert!(!store.get(&name).unwrap().enabled);

        store.set_enabled(&name, true).unwrap();
        assert_eq!(store.due(far_future).len(), 1);
    }

    #[test]
    fn advance_moves_strictly_past_now() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlowStore::open(dir.path()).unwrap();
        let every_minute = FLOW.replace("0 3 * * *", "* * * * *");
        let name = store.add(&every_minute).unwrap();

        let now = Utc::now();
        store.advance(&name, now);
        let next = store.next_fire_at(&name).unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::minutes(1));
    }

    #[test]
    fn remove_unknown_flow_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlowStore::open(dir.path()).unwrap();
        assert!(store.remove("ghost").is_err());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn script_gate_parses_stdout() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "#!/bin/sh\necho '{{\"execute\": true, \"output\": {{\"url\": \"u\"}}}}'"
        )
        .unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let gate = super::run_script(&path).await.unwrap();
        assert!(gate.execute);
        assert_eq!(gate.output.get("url").map(String::as_str), Some("u"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn script_nonzero_exit_is_a_failure() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nexit 3").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(super::run_script(&path).await.is_err());
    }
}
