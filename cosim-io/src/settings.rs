//! Connection settings.
//!
//! Settings arrive as a string-keyed map (the form solver adapters can produce from JSON or a
//! scripting language) and are validated eagerly at `connect` into [`Settings`]. The key set is
//! closed: unrecognized keys are rejected.

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use crate::error::ConnectionError;

/// Settings as supplied by the participant.
pub type SettingsMap = BTreeMap<String, String>;

/// How payloads cross the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommunicationFormat {
    /// Payload files gated by atomically renamed marker files.
    #[default]
    File,
    /// Shared buffers, both participants in one address space.
    InProcess,
}

impl FromStr for CommunicationFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "in_process" | "in-process" => Ok(Self::InProcess),
            _ => Err(format!("expected one of \"file\", \"in_process\", got \"{s}\"")),
        }
    }
}

/// When the orchestrator runs the mesh phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeshExportPolicy {
    /// Only on the first coupling step; the interface topology does not change.
    #[default]
    FirstStepOnly,
    /// On every coupling step, for topologically varying interfaces.
    EveryStep,
}

impl MeshExportPolicy {
    pub fn applies_to(self, step: usize) -> bool {
        match self {
            MeshExportPolicy::FirstStepOnly => step == 0,
            MeshExportPolicy::EveryStep => true,
        }
    }
}

impl FromStr for MeshExportPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_step" => Ok(Self::FirstStepOnly),
            "every_step" => Ok(Self::EveryStep),
            _ => Err(format!("expected \"first_step\" or \"every_step\", got \"{s}\"")),
        }
    }
}

/// Validated settings of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub communication_format: CommunicationFormat,
    /// Verbosity of the library's own log output for this connection.
    pub echo_level: u32,
    /// Log the wall-clock duration of every phase and exchange.
    pub print_timing: bool,
    /// Name of the local solver, defaults to the connection name.
    pub solver_name: Option<String>,
    /// Name of the partner solver, used in error messages.
    pub partner_name: String,
    /// A steady-state solver has no `AdvanceInTime` phase.
    pub steady_state: bool,
    pub mesh_export: MeshExportPolicy,
    /// Root directory of the file transport.
    pub working_directory: PathBuf,
    /// How often a blocked receive re-checks for its payload.
    pub poll_interval: Duration,
    /// Upper bound on a blocked receive; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            communication_format: CommunicationFormat::default(),
            echo_level: 0,
            print_timing: false,
            solver_name: None,
            partner_name: "partner".to_owned(),
            steady_state: false,
            mesh_export: MeshExportPolicy::default(),
            working_directory: PathBuf::from("."),
            poll_interval: Duration::from_millis(10),
            timeout: Some(Duration::from_millis(60_000)),
        }
    }
}

impl Settings {
    /// Every key accepted by [`Settings::from_map`].
    pub const KEYS: &'static [&'static str] = &[
        "communication_format",
        "echo_level",
        "print_timing",
        "solver_name",
        "partner_name",
        "steady_state",
        "mesh_export",
        "working_directory",
        "poll_interval_ms",
        "timeout_ms",
    ];

    /// Keys that only make sense for [`CommunicationFormat::File`].
    const FILE_ONLY_KEYS: &'static [&'static str] = &["working_directory"];

    /// Validate `map` for `connection`, filling defaults for missing keys.
    pub fn from_map(connection: &str, map: &SettingsMap) -> Result<Self, ConnectionError> {
        let invalid = |key: &str, reason: String| ConnectionError::InvalidSettings {
            connection: connection.to_owned(),
            key: key.to_owned(),
            reason,
        };

        if let Some(key) = map.keys().find(|k| !Self::KEYS.contains(&k.as_str())) {
            return Err(invalid(key, "unrecognized key".to_owned()));
        }

        let mut settings = Self::default();

        if let Some(value) = map.get("communication_format") {
            settings.communication_format = value
                .parse()
                .map_err(|e| invalid("communication_format", e))?;
        }
        if let Some(value) = map.get("echo_level") {
            settings.echo_level = value
                .trim()
                .parse()
                .map_err(|_| {
                    invalid(
                        "echo_level",
                        format!("expected a non-negative integer, got \"{value}\""),
                    )
                })?;
        }
        if let Some(value) = map.get("print_timing") {
            settings.print_timing = parse_bool(value).map_err(|e| invalid("print_timing", e))?;
        }
        if let Some(value) = map.get("solver_name") {
            settings.solver_name = Some(non_empty(value).map_err(|e| invalid("solver_name", e))?);
        }
        if let Some(value) = map.get("partner_name") {
            settings.partner_name = non_empty(value).map_err(|e| invalid("partner_name", e))?;
        }
        if let Some(value) = map.get("steady_state") {
            settings.steady_state = parse_bool(value).map_err(|e| invalid("steady_state", e))?;
        }
        if let Some(value) = map.get("mesh_export") {
            settings.mesh_export = value.parse().map_err(|e| invalid("mesh_export", e))?;
        }
        if let Some(value) = map.get("working_directory") {
            let dir = non_empty(value).map_err(|e| invalid("working_directory", e))?;
            settings.working_directory = PathBuf::from(dir);
        }
        if let Some(value) = map.get("poll_interval_ms") {
            let ms = parse_millis(value).map_err(|e| invalid("poll_interval_ms", e))?;
            if ms == 0 {
                return Err(invalid("poll_interval_ms", "must be positive".to_owned()));
            }
            settings.poll_interval = Duration::from_millis(ms);
        }
        if let Some(value) = map.get("timeout_ms") {
            let ms = parse_millis(value).map_err(|e| invalid("timeout_ms", e))?;
            settings.timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if settings.communication_format != CommunicationFormat::File {
            if let Some(key) = Self::FILE_ONLY_KEYS.iter().find(|k| map.contains_key(**k)) {
                return Err(invalid(
                    key,
                    "only valid with communication_format \"file\"".to_owned(),
                ));
            }
        }

        #[cfg(not(feature = "file"))]
        if settings.communication_format == CommunicationFormat::File {
            return Err(invalid(
                "communication_format",
                "the file transport is not enabled in this build".to_owned(),
            ));
        }
        #[cfg(not(feature = "in-process"))]
        if settings.communication_format == CommunicationFormat::InProcess {
            return Err(invalid(
                "communication_format",
                "the in-process transport is not enabled in this build".to_owned(),
            ));
        }

        Ok(settings)
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(format!("expected a boolean, got \"{other}\"")),
    }
}

fn parse_millis(value: &str) -> Result<u64, String> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            format!("expected a non-negative integer number of milliseconds, got \"{value}\"")
        })
}

fn non_empty(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        Err("must not be empty".to_owned())
    } else {
        Ok(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn map(pairs: &[(&str, &str)]) -> SettingsMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_map("TAU", &SettingsMap::new()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_tau_settings() {
        let settings = Settings::from_map(
            "TAU",
            &map(&[
                ("echo_level", "0"),
                ("print_timing", "1"),
                ("communication_format", "file"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.communication_format, CommunicationFormat::File);
        assert!(settings.print_timing);
        assert_eq!(settings.echo_level, 0);
    }

    #[test]
    fn test_timeout_zero_waits_forever() {
        let settings = Settings::from_map("c", &map(&[("timeout_ms", "0")])).unwrap();
        assert_eq!(settings.timeout, None);
    }

    #[rstest]
    #[case("echo_level", "-1")]
    #[case("echo_level", "loud")]
    #[case("communication_format", "socket")]
    #[case("print_timing", "yes")]
    #[case("mesh_export", "sometimes")]
    #[case("poll_interval_ms", "0")]
    #[case("partner_name", "")]
    #[case("unknown_key", "1")]
    fn test_invalid(#[case] key: &str, #[case] value: &str) {
        match Settings::from_map("c", &map(&[(key, value)])) {
            Err(ConnectionError::InvalidSettings {
                connection,
                key: bad_key,
                ..
            }) => {
                assert_eq!(connection, "c");
                assert_eq!(bad_key, key);
            }
            other => panic!("expected InvalidSettings, got {other:?}"),
        }
    }

    #[test]
    fn test_file_only_key_with_in_process() {
        let result = Settings::from_map(
            "c",
            &map(&[
                ("communication_format", "in_process"),
                ("working_directory", "/tmp"),
            ]),
        );
        assert!(matches!(
            result,
            Err(ConnectionError::InvalidSettings { key, .. }) if key == "working_directory"
        ));
    }

    #[test]
    fn test_mesh_policy() {
        assert!(MeshExportPolicy::FirstStepOnly.applies_to(0));
        assert!(!MeshExportPolicy::FirstStepOnly.applies_to(2));
        assert!(MeshExportPolicy::EveryStep.applies_to(2));
    }
}
