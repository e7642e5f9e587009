//! # Playbook Generation
//!
//! Builds the inventory and playbook handed to the automation runner for
//! each task type. Step names are significant: callback handlers classify
//! events by them (`check <item>`, a CVE id, `set repo`, `scan`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::config::{CheckItem, FixFunction, TaskConfig};
use crate::constants::steps;
use crate::models::{CveHostUnit, HostInfo, RepoHostUnit, TaskCve};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryHost {
    pub ansible_host: String,
    pub host_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryGroup {
    pub hosts: BTreeMap<String, InventoryHost>,
}

/// Host groups keyed by group name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub groups: BTreeMap<String, InventoryGroup>,
}

impl Inventory {
    pub fn add_host(&mut self, group: &str, host: &HostInfo) {
        self.groups.entry(group.to_string()).or_default().hosts.insert(
            host.host_name.clone(),
            InventoryHost {
                ansible_host: host.host_ip.clone(),
                host_id: host.host_id,
            },
        );
    }

    pub fn group(&self, name: &str) -> Option<&InventoryGroup> {
        self.groups.get(name)
    }

    pub fn host_count(&self) -> usize {
        self.groups
            .get(steps::TOTAL_HOSTS_GROUP)
            .map(|g| g.hosts.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyArgs {
    pub src: String,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootArgs {
    pub reboot_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepAction {
    Shell { shell: String },
    Copy { copy: CopyArgs },
    Reboot { reboot: RebootArgs },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayStep {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub ignore_errors: bool,
}

impl PlayStep {
    fn shell(name: &str, command: String) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Shell { shell: command },
            ignore_errors: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Play {
    pub name: String,
    pub hosts: String,
    pub gather_facts: bool,
    #[serde(rename = "become")]
    pub escalate: bool,
    pub tasks: Vec<PlayStep>,
}

impl Play {
    fn new(name: &str, hosts: &str, tasks: Vec<PlayStep>) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.to_string(),
            gather_facts: false,
            escalate: true,
            tasks,
        }
    }
}

/// Ordered list of plays
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Playbook {
    pub plays: Vec<Play>,
}

impl Playbook {
    pub fn step_names(&self) -> Vec<&str> {
        self.plays
            .iter()
            .flat_map(|p| p.tasks.iter().map(|t| t.name.as_str()))
            .collect()
    }
}

/// Inventory and playbook for one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedRun {
    pub inventory: Inventory,
    pub playbook: Playbook,
    /// CVEs that could not be given a step; their units never report
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_cves: Vec<String>,
}

impl PreparedRun {
    pub fn inventory_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.inventory)
    }

    pub fn playbook_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.playbook)
    }
}

fn check_play(check_items: &[CheckItem]) -> Option<Play> {
    if check_items.is_empty() {
        return None;
    }
    let tasks = check_items
        .iter()
        .map(|item| PlayStep::shell(&steps::check_step(&item.name), item.command.clone()))
        .collect();
    Some(Play::new("check", steps::TOTAL_HOSTS_GROUP, tasks))
}

fn unit_host(unit: &CveHostUnit) -> HostInfo {
    HostInfo::new(unit.host_id, &unit.host_name, &unit.host_ip)
}

#[derive(Debug, Clone)]
pub struct PlaybookBuilder {
    config: TaskConfig,
}

impl PlaybookBuilder {
    pub fn new(config: TaskConfig) -> Self {
        Self { config }
    }

    fn cve_inventory(cves: &[TaskCve], units: &[CveHostUnit]) -> Inventory {
        let reboot_cves: BTreeSet<&str> = cves
            .iter()
            .filter(|c| c.reboot)
            .map(|c| c.cve_id.as_str())
            .collect();
        let mut inventory = Inventory::default();
        for unit in units {
            let host = unit_host(unit);
            inventory.add_host(steps::TOTAL_HOSTS_GROUP, &host);
            inventory.add_host(&unit.cve_id, &host);
            if reboot_cves.contains(unit.cve_id.as_str()) {
                inventory.add_host(steps::REBOOT_HOSTS_GROUP, &host);
            }
        }
        inventory
    }

    /// Fix plays: checks, one play per CVE targeting the CVE's group, then a
    /// reboot play when any CVE requires it
    pub fn cve_fix(&self, cves: &[TaskCve], units: &[CveHostUnit]) -> PreparedRun {
        let inventory = Self::cve_inventory(cves, units);
        let mut plays: Vec<Play> = check_play(&self.config.cve_check_items).into_iter().collect();
        let mut skipped_cves = Vec::new();

        for cve in cves {
            if inventory.group(&cve.cve_id).is_none() {
                continue;
            }
            let command = match self.config.fix_function {
                FixFunction::Yum => format!("yum upgrade -y --cve={}", cve.cve_id),
                FixFunction::Rpm if cve.packages.is_empty() => {
                    warn!(cve_id = %cve.cve_id, "No package known for cve, skipping fix step");
                    skipped_cves.push(cve.cve_id.clone());
                    continue;
                }
                FixFunction::Rpm => format!("yum upgrade -y {}", cve.packages.join(" ")),
            };
            plays.push(Play::new(
                &cve.cve_id,
                &cve.cve_id,
                vec![PlayStep::shell(&cve.cve_id, command)],
            ));
        }

        if inventory.group(steps::REBOOT_HOSTS_GROUP).is_some() {
            plays.push(Play::new(
                steps::REBOOT,
                steps::REBOOT_HOSTS_GROUP,
                vec![PlayStep {
                    name: steps::REBOOT.to_string(),
                    action: StepAction::Reboot {
                        reboot: RebootArgs {
                            reboot_timeout: 600,
                        },
                    },
                    ignore_errors: false,
                }],
            ));
        }

        PreparedRun {
            inventory,
            playbook: Playbook { plays },
            skipped_cves,
        }
    }

    /// Rollback plays downgrade each CVE's packages; a CVE with no known
    /// package gets no step
    pub fn cve_rollback(&self, cves: &[TaskCve], units: &[CveHostUnit]) -> PreparedRun {
        let mut inventory = Self::cve_inventory(cves, units);
        inventory.groups.remove(steps::REBOOT_HOSTS_GROUP);
        let mut plays = Vec::new();
        let mut skipped_cves = Vec::new();

        for cve in cves {
            if inventory.group(&cve.cve_id).is_none() {
                continue;
            }
            if cve.packages.is_empty() {
                warn!(cve_id = %cve.cve_id, "No package known for cve, skipping rollback step");
                skipped_cves.push(cve.cve_id.clone());
                continue;
            }
            plays.push(Play::new(
                &cve.cve_id,
                &cve.cve_id,
                vec![PlayStep::shell(
                    &cve.cve_id,
                    format!("yum downgrade -y {}", cve.packages.join(" ")),
                )],
            ));
        }

        PreparedRun {
            inventory,
            playbook: Playbook { plays },
            skipped_cves,
        }
    }

    /// Checks, then copy the repo file into place and rebuild the yum cache
    pub fn repo_set(&self, username: &str, repo_name: &str, units: &[RepoHostUnit]) -> PreparedRun {
        let mut inventory = Inventory::default();
        for unit in units {
            inventory.add_host(
                steps::TOTAL_HOSTS_GROUP,
                &HostInfo::new(unit.host_id, &unit.host_name, &unit.host_ip),
            );
        }

        let mut plays: Vec<Play> = check_play(&self.config.repo_check_items).into_iter().collect();
        plays.push(Play::new(
            repo_name,
            steps::TOTAL_HOSTS_GROUP,
            vec![
                PlayStep {
                    name: steps::COPY_REPO.to_string(),
                    action: StepAction::Copy {
                        copy: CopyArgs {
                            src: format!("{}/{}/{}.repo", self.config.repo_dir, username, repo_name),
                            dest: self.config.repo_target_path.clone(),
                        },
                    },
                    ignore_errors: false,
                },
                PlayStep::shell(steps::SET_REPO, "yum makecache".to_string()),
            ],
        ));

        PreparedRun {
            inventory,
            playbook: Playbook { plays },
            skipped_cves: Vec::new(),
        }
    }

    pub fn cve_scan(&self, hosts: &[HostInfo]) -> PreparedRun {
        let mut inventory = Inventory::default();
        for host in hosts {
            inventory.add_host(steps::TOTAL_HOSTS_GROUP, host);
        }
        let plays = vec![Play::new(
            steps::SCAN,
            steps::TOTAL_HOSTS_GROUP,
            vec![PlayStep::shell(
                steps::SCAN,
                "yum updateinfo list cves installed".to_string(),
            )],
        )];
        PreparedRun {
            inventory,
            playbook: Playbook { plays },
            skipped_cves: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CveHostStatus, RepoStatus};

    fn task_cve(cve: &str, reboot: bool, packages: &[&str]) -> TaskCve {
        TaskCve {
            task_id: "t".into(),
            cve_id: cve.into(),
            reboot,
            progress: 0,
            host_num: 1,
            packages: packages.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn unit(cve: &str, host_id: i64) -> CveHostUnit {
        CveHostUnit {
            task_id: "t".into(),
            cve_id: cve.into(),
            host_id,
            host_name: format!("h{host_id}"),
            host_ip: format!("10.0.0.{host_id}"),
            status: CveHostStatus::Unfixed,
        }
    }

    #[test]
    fn fix_groups_hosts_per_cve_and_adds_reboot_play() {
        let mut config = TaskConfig::default();
        config.cve_check_items = vec![CheckItem {
            name: "network".into(),
            command: "true".into(),
        }];
        let builder = PlaybookBuilder::new(config);
        let run = builder.cve_fix(
            &[task_cve("cve-1", true, &[]), task_cve("cve-2", false, &[])],
            &[unit("cve-1", 1), unit("cve-2", 1), unit("cve-2", 2)],
        );

        assert_eq!(run.inventory.host_count(), 2);
        assert_eq!(run.inventory.group("cve-2").unwrap().hosts.len(), 2);
        assert_eq!(run.inventory.group("reboot_hosts").unwrap().hosts.len(), 1);
        assert_eq!(
            run.playbook.step_names(),
            vec!["check network", "cve-1", "cve-2", "reboot"]
        );
    }

    #[test]
    fn rpm_mode_skips_cves_without_packages() {
        let config = TaskConfig {
            fix_function: FixFunction::Rpm,
            ..TaskConfig::default()
        };
        let run = PlaybookBuilder::new(config).cve_fix(
            &[task_cve("cve-1", false, &["openssl"]), task_cve("cve-2", false, &[])],
            &[unit("cve-1", 1), unit("cve-2", 1)],
        );
        assert_eq!(run.skipped_cves, vec!["cve-2".to_string()]);
        assert_eq!(run.playbook.step_names(), vec!["cve-1"]);
    }

    #[test]
    fn repo_set_ends_with_set_repo_step() {
        let run = PlaybookBuilder::new(TaskConfig::default()).repo_set(
            "admin",
            "update-20.03",
            &[RepoHostUnit {
                task_id: "t".into(),
                repo_name: "update-20.03".into(),
                host_id: 1,
                host_name: "h1".into(),
                host_ip: "10.0.0.1".into(),
                status: RepoStatus::Unset,
            }],
        );
        assert_eq!(run.playbook.step_names(), vec!["copy repo", "set repo"]);
        let json = run.playbook_json().unwrap();
        assert!(json.contains("/opt/aops/repo/admin/update-20.03.repo"));
        assert!(json.contains("\"become\": true"));
    }
}
