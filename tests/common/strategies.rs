#![allow(dead_code)]

use proptest::prelude::*;
use remediation_core::constants::CveHostStatus;
use remediation_core::database::ProgressMode;

/// Any raw CVE unit status
pub fn cve_status_strategy() -> impl Strategy<Value = CveHostStatus> {
    prop_oneof![
        Just(CveHostStatus::Unfixed),
        Just(CveHostStatus::Fixed),
        Just(CveHostStatus::Running),
        Just(CveHostStatus::Unknown),
    ]
}

/// Non-empty batch of unit statuses for one CVE
pub fn cve_statuses_strategy() -> impl Strategy<Value = Vec<CveHostStatus>> {
    prop::collection::vec(cve_status_strategy(), 1..16)
}

pub fn progress_mode_strategy() -> impl Strategy<Value = ProgressMode> {
    prop_oneof![
        4 => Just(ProgressMode::Add),
        1 => Just(ProgressMode::Fill),
    ]
}
