use serde::Serialize;

use super::execute::LoadReport;
use crate::target::RelationalStore;
use crate::AppResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleAttribute {
    pub name: String,
    pub is_encrypted: bool,
    pub value_len: usize,
}

/// One user's attribute set for manual inspection. Values are withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSample {
    pub user_id: String,
    pub attributes: Vec<SampleAttribute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub total_users_in_target: u64,
    pub total_attributes_in_target: u64,
    pub users_expected: u64,
    pub users_found: u64,
    pub attributes_expected: u64,
    pub attributes_found: u64,
    pub mismatches: Vec<String>,
    pub sample: Option<UserSample>,
    pub validation_passed: bool,
}

/// Checks that the per-category counts from the load stage match what is
/// observable in `target`: every counted user and attribute must be present.
///
/// An empty load is consistent and passes. Mismatches are reported, never raised.
pub fn validate_migration(
    target: &RelationalStore,
    load: &LoadReport,
    sample_user: Option<&str>,
) -> AppResult<ValidationReport> {
    let mut report = ValidationReport {
        total_users_in_target: target.count_users()?,
        total_attributes_in_target: target.count_attributes()?,
        users_expected: load.counts.users,
        attributes_expected: load.counts.attributes(),
        ..ValidationReport::default()
    };

    if load.users_written.len() as u64 != report.users_expected {
        report.mismatches.push(format!(
            "{} users counted but {} distinct users written",
            report.users_expected,
            load.users_written.len()
        ));
    }
    if load.attributes_written.len() as u64 != report.attributes_expected {
        report.mismatches.push(format!(
            "{} attributes counted but {} distinct attributes written",
            report.attributes_expected,
            load.attributes_written.len()
        ));
    }

    for user_id in &load.users_written {
        if target.user_exists(user_id)? {
            report.users_found += 1;
        } else {
            report.mismatches.push(format!("user {user_id} missing from target"));
        }
    }

    for (user_id, name) in &load.attributes_written {
        if target.attribute_exists(user_id, name)? {
            report.attributes_found += 1;
        } else {
            report
                .mismatches
                .push(format!("attribute {name} of user {user_id} missing from target"));
        }
    }

    if report.total_users_in_target < report.users_expected {
        report.mismatches.push(format!(
            "target holds {} users, expected at least {}",
            report.total_users_in_target, report.users_expected
        ));
    }
    if report.total_attributes_in_target < report.attributes_expected {
        report.mismatches.push(format!(
            "target holds {} attributes, expected at least {}",
            report.total_attributes_in_target, report.attributes_expected
        ));
    }

    let sample_id = sample_user
        .map(str::to_string)
        .or_else(|| load.users_written.iter().next().cloned());
    if let Some(user_id) = sample_id {
        report.sample = Some(sample(target, &user_id)?);
    }

    report.validation_passed = report.mismatches.is_empty()
        && report.users_found == report.users_expected
        && report.attributes_found == report.attributes_expected;

    if report.validation_passed {
        tracing::info!(
            target: "metis_migrate",
            event = "validation_passed",
            users = report.users_found,
            attributes = report.attributes_found
        );
    } else {
        tracing::warn!(
            target: "metis_migrate",
            event = "validation_failed",
            mismatches = report.mismatches.len()
        );
    }
    Ok(report)
}

fn sample(target: &RelationalStore, user_id: &str) -> AppResult<UserSample> {
    let attributes = target
        .list_attributes(user_id)?
        .into_iter()
        .map(|attr| SampleAttribute {
            value_len: attr.value.chars().count(),
            name: attr.name,
            is_encrypted: attr.is_encrypted,
        })
        .collect();
    Ok(UserSample {
        user_id: user_id.to_string(),
        attributes,
    })
}
