//! Description of the debug topology of a target.
//!
//! A [`SessionConfig`] is usually loaded from YAML:
//!
//! ```yaml
//! cores:
//!   - name: cpu0
//!     ap: 1
//!     debug_base: 0x80010000
//!     cti: cti0
//!   - name: cpu1
//!     ap: 1
//!     debug_base: 0x80012000
//!     cti: cti1
//! ctis:
//!   - name: cti0
//!     ap: 1
//!     base: 0x80020000
//!   - name: cti1
//!     ap: 1
//!     base: 0x80022000
//! smp_groups:
//!   - name: cluster0
//!     cores: [cpu0, cpu1]
//! ```

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// What happens to a core when it comes out of reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetCatch {
    /// The core starts running after reset.
    #[default]
    Run,
    /// The core halts on its first instruction after reset.
    Halt,
}

/// How reset is asserted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStrategy {
    /// The system reset line of the transport.
    #[default]
    SystemReset,
    /// A warm reset of the core through EDPRCR.CWRR.
    WarmReset,
}

fn default_true() -> bool {
    true
}

/// A core and how to reach its debug registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub name: String,
    /// Access port the debug registers sit behind.
    pub ap: u8,
    /// Base address of the external debug registers.
    pub debug_base: u64,
    /// Name of the CTI wired to this core.
    pub cti: String,
    #[serde(default)]
    pub reset_catch: ResetCatch,
    #[serde(default)]
    pub reset_strategy: ResetStrategy,
    /// Mask interrupts while single stepping.
    #[serde(default = "default_true")]
    pub step_interrupt_masking: bool,
}

/// A cross trigger interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtiConfig {
    pub name: String,
    pub ap: u8,
    pub base: u64,
}

/// Cores that halt and resume together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpGroupConfig {
    pub name: String,
    /// Member core names.
    pub cores: Vec<String>,
    /// Pulse each member individually when a group halt did not reach it.
    ///
    /// Some interconnects drop cross triggers while a core is entering a low power state.
    #[serde(default = "default_true")]
    pub smp_halt_retry: bool,
}

/// Bounds of the polling loops, in milliseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Halt, resume and single instruction completion.
    pub halt_ms: u64,
    /// Completion of a single step.
    pub step_ms: u64,
    /// Halt after a reset with reset catch enabled.
    pub reset_halt_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            halt_ms: 1000,
            step_ms: 100,
            reset_halt_ms: 500,
        }
    }
}

impl Timeouts {
    pub fn halt(&self) -> Duration {
        Duration::from_millis(self.halt_ms)
    }

    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }

    pub fn reset_halt(&self) -> Duration {
        Duration::from_millis(self.reset_halt_ms)
    }
}

/// The complete debug topology handed to a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub cores: Vec<CoreConfig>,
    #[serde(default)]
    pub ctis: Vec<CtiConfig>,
    #[serde(default)]
    pub smp_groups: Vec<SmpGroupConfig>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// A core with its CTI reference resolved, as used by the core drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreDefinition {
    /// Index of the core in the session.
    pub id: usize,
    pub name: String,
    pub ap: u8,
    pub debug_base: u64,
    pub cti_ap: u8,
    pub cti_base: u64,
    pub reset_catch: ResetCatch,
    pub reset_strategy: ResetStrategy,
    pub timeouts: Timeouts,
}

/// An SMP group with its members resolved to core indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpGroup {
    pub name: String,
    pub members: Vec<usize>,
    pub smp_halt_retry: bool,
}

impl SessionConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        let config: SessionConfig = serde_yaml::from_str(yaml)?;
        config.validate().map_err(Error::InvalidConfig)?;

        Ok(config)
    }

    pub fn from_yaml_reader<R: std::io::Read>(reader: R) -> Result<Self, Error> {
        let config: SessionConfig = serde_yaml::from_reader(reader)?;
        config.validate().map_err(Error::InvalidConfig)?;

        Ok(config)
    }

    /// Validates the configuration and returns an error describing the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.ensure_at_least_one_core()?;
        self.reject_duplicate_names()?;
        self.ensure_ctis_exist()?;
        self.reject_duplicate_debug_bases()?;
        self.ensure_group_members_exist()?;
        self.reject_cores_in_multiple_groups()?;

        Ok(())
    }

    fn ensure_at_least_one_core(&self) -> Result<(), String> {
        if self.cores.is_empty() {
            return Err("the configuration does not contain any cores".to_string());
        }

        Ok(())
    }

    fn reject_duplicate_names(&self) -> Result<(), String> {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        for core in &self.cores {
            if !seen.insert(&core.name) {
                return Err(format!("core `{}` appears multiple times", core.name));
            }
        }

        let mut seen = HashSet::new();
        for cti in &self.ctis {
            if !seen.insert(&cti.name) {
                return Err(format!("CTI `{}` appears multiple times", cti.name));
            }
        }

        Ok(())
    }

    /// Make sure the CTI referenced by every core exists (this is basically a check for typos).
    fn ensure_ctis_exist(&self) -> Result<(), String> {
        for core in &self.cores {
            if !self.ctis.iter().any(|cti| cti.name == core.cti) {
                return Err(format!(
                    "unknown CTI `{}` for core `{}`",
                    core.cti, core.name
                ));
            }
        }

        Ok(())
    }

    fn reject_duplicate_debug_bases(&self) -> Result<(), String> {
        let mut seen = HashMap::new();

        for core in &self.cores {
            if let Some(other) = seen.insert((core.ap, core.debug_base), &core.name) {
                return Err(format!(
                    "cores `{}` and `{}` share the debug base {:#010x}",
                    other, core.name, core.debug_base
                ));
            }
        }

        Ok(())
    }

    fn ensure_group_members_exist(&self) -> Result<(), String> {
        for group in &self.smp_groups {
            if group.cores.is_empty() {
                return Err(format!("SMP group `{}` has no members", group.name));
            }

            for member in &group.cores {
                if !self.cores.iter().any(|core| &core.name == member) {
                    return Err(format!(
                        "SMP group `{}` refers to a non-existent core `{}`",
                        group.name, member
                    ));
                }
            }
        }

        Ok(())
    }

    fn reject_cores_in_multiple_groups(&self) -> Result<(), String> {
        let mut membership = HashMap::new();

        for group in &self.smp_groups {
            for member in &group.cores {
                if let Some(other) = membership.insert(member, &group.name) {
                    return Err(format!(
                        "core `{}` is a member of both `{}` and `{}`",
                        member, other, group.name
                    ));
                }
            }
        }

        Ok(())
    }

    /// Resolve name references into indices. The configuration must be valid.
    pub(crate) fn resolve(&self) -> Result<(Vec<CoreDefinition>, Vec<SmpGroup>), Error> {
        self.validate().map_err(Error::InvalidConfig)?;

        let mut cores = Vec::with_capacity(self.cores.len());
        for (id, core) in self.cores.iter().enumerate() {
            let cti = self
                .ctis
                .iter()
                .find(|cti| cti.name == core.cti)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown CTI `{}`", core.cti)))?;

            cores.push(CoreDefinition {
                id,
                name: core.name.clone(),
                ap: core.ap,
                debug_base: core.debug_base,
                cti_ap: cti.ap,
                cti_base: cti.base,
                reset_catch: core.reset_catch,
                reset_strategy: core.reset_strategy,
                timeouts: self.timeouts,
            });
        }

        let mut groups = Vec::with_capacity(self.smp_groups.len());
        for group in &self.smp_groups {
            let members = group
                .cores
                .iter()
                .map(|name| {
                    self.cores
                        .iter()
                        .position(|core| &core.name == name)
                        .ok_or_else(|| Error::InvalidConfig(format!("unknown core `{name}`")))
                })
                .collect::<Result<Vec<_>, _>>()?;

            groups.push(SmpGroup {
                name: group.name.clone(),
                members,
                smp_halt_retry: group.smp_halt_retry,
            });
        }

        Ok((cores, groups))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const TWO_CORES: &str = r#"
cores:
  - name: cpu0
    ap: 1
    debug_base: 0x80010000
    cti: cti0
    reset_catch: halt
  - name: cpu1
    ap: 1
    debug_base: 0x80012000
    cti: cti1
    reset_strategy: warm_reset
    step_interrupt_masking: false
ctis:
  - name: cti0
    ap: 1
    base: 0x80020000
  - name: cti1
    ap: 1
    base: 0x80022000
smp_groups:
  - name: cluster0
    cores: [cpu0, cpu1]
timeouts:
  step_ms: 20
"#;

    #[test]
    fn parse_and_resolve() {
        let config = SessionConfig::from_yaml_str(TWO_CORES).unwrap();

        assert_eq!(config.timeouts.step_ms, 20);
        assert_eq!(config.timeouts.halt_ms, 1000);
        assert!(config.cores[0].step_interrupt_masking);
        assert!(!config.cores[1].step_interrupt_masking);
        assert_eq!(config.cores[1].reset_strategy, ResetStrategy::WarmReset);

        let (cores, groups) = config.resolve().unwrap();

        assert_eq!(cores[1].cti_base, 0x8002_2000);
        assert_eq!(cores[0].reset_catch, ResetCatch::Halt);
        assert_eq!(
            groups,
            vec![SmpGroup {
                name: "cluster0".to_string(),
                members: vec![0, 1],
                smp_halt_retry: true,
            }]
        );
    }

    fn rejected(yaml: &str) -> String {
        match SessionConfig::from_yaml_str(yaml) {
            Err(Error::InvalidConfig(message)) => message,
            other => panic!("expected an invalid configuration, got {other:?}"),
        }
    }

    #[test]
    fn unknown_cti_is_rejected() {
        let yaml = TWO_CORES.replace("cti: cti1", "cti: cti9");

        assert!(rejected(&yaml).contains("cti9"));
    }

    #[test]
    fn duplicate_debug_base_is_rejected() {
        let yaml = TWO_CORES.replace("0x80012000", "0x80010000");

        assert!(rejected(&yaml).contains("share the debug base"));
    }

    #[test]
    fn core_in_two_groups_is_rejected() {
        let yaml = TWO_CORES.replace(
            "timeouts:",
            "  - name: cluster1\n    cores: [cpu1]\ntimeouts:",
        );

        assert!(rejected(&yaml).contains("member of both"));
    }

    #[test]
    fn unknown_group_member_is_rejected() {
        let yaml = TWO_CORES.replace("[cpu0, cpu1]", "[cpu0, cpu7]");

        assert!(rejected(&yaml).contains("cpu7"));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        assert!(matches!(
            SessionConfig::from_yaml_str("cores: 12"),
            Err(Error::ConfigParse(_))
        ));
    }
}
