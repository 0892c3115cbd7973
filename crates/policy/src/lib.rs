//! Pure policy decision engine.
//!
//! `decide` maps caller attributes and the sensitivity a plan touches to a
//! decision plus the constraints downstream stages must honor. There is no
//! I/O here and no hidden state: the same inputs always give the same
//! decision.

use vba_contracts::{
    ConstraintSet, DecisionResult, PolicyDecision, PolicyOverrides, Purpose, QueryPlan, Role,
    Sensitivity, UserAttributes,
};

pub const REASON_UNKNOWN_ROLE: &str = "unrecognized role";
pub const REASON_REGION_REQUIRED: &str = "must select a specific region";
pub const REASON_HIGH_DENIED: &str = "high sensitivity denied for this role";
pub const REASON_MED_DENIED: &str = "role lacks medium-sensitivity access";
pub const REASON_ALLOWED: &str = "query allowed for role";
pub const REASON_HIGH_ALLOWED: &str = "high sensitivity data allowed with masking and access logging";
/// Appended to the reason when a `min_group_size` override of 0 is raised.
pub const NOTE_MIN_GROUP_SIZE_RAISED: &str = "min_group_size override 0 raised to 1";

const INVESTIGATION_MAX_ROWS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleProfile {
    pub role: Role,
    pub max_sensitivity: Sensitivity,
    pub can_export: bool,
}

pub fn role_profile(role: Role) -> RoleProfile {
    let (max_sensitivity, can_export) = match role {
        Role::BranchManager => (Sensitivity::Low, false),
        Role::RiskOfficer => (Sensitivity::Med, true),
        Role::ComplianceOfficer => (Sensitivity::High, true),
        Role::Auditor => (Sensitivity::High, true),
        Role::DataAnalyst => (Sensitivity::Low, false),
    };
    RoleProfile {
        role,
        max_sensitivity,
        can_export,
    }
}

pub fn decide(
    user: &UserAttributes,
    plan: &QueryPlan,
    overrides: &PolicyOverrides,
) -> PolicyDecision {
    decide_for_tier(user, plan.sensitivity(), overrides)
}

/// Evaluates the decision table, first match wins, then layers constraints
/// in fixed order: base, purpose, overrides, region, forced region.
pub fn decide_for_tier(
    user: &UserAttributes,
    tier: Sensitivity,
    overrides: &PolicyOverrides,
) -> PolicyDecision {
    let Some(role) = user.role() else {
        return PolicyDecision::deny(REASON_UNKNOWN_ROLE);
    };

    if role == Role::BranchManager && user.is_all_regions() {
        return PolicyDecision::deny(REASON_REGION_REQUIRED);
    }

    let profile = role_profile(role);
    let (result, reason, mut constraints) = match tier {
        Sensitivity::High => match role {
            Role::ComplianceOfficer | Role::Auditor => (
                DecisionResult::AllowWithConstraints,
                REASON_HIGH_ALLOWED,
                high_tier_constraints(role),
            ),
            _ => return PolicyDecision::deny(REASON_HIGH_DENIED),
        },
        Sensitivity::Med if profile.max_sensitivity < Sensitivity::Med => {
            return PolicyDecision::deny(REASON_MED_DENIED);
        }
        Sensitivity::Med | Sensitivity::Low => (
            DecisionResult::Allow,
            REASON_ALLOWED,
            ConstraintSet {
                min_group_size: Some(ConstraintSet::DEFAULT_MIN_GROUP_SIZE),
                ..ConstraintSet::default()
            },
        ),
    };

    apply_purpose(&mut constraints, user.purpose());
    let raised_min_group_size = apply_overrides(&mut constraints, overrides);

    if !user.is_all_regions() {
        constraints.region_filter = Some(user.region.trim().to_string());
    }
    if overrides.force_region_match
        && let Some(region) = overrides
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    {
        constraints.region_filter = Some(region.to_string());
    }

    let mut reason = reason.to_string();
    if raised_min_group_size {
        reason.push_str("; ");
        reason.push_str(NOTE_MIN_GROUP_SIZE_RAISED);
    }

    PolicyDecision {
        result,
        reason,
        constraints,
    }
}

fn high_tier_constraints(role: Role) -> ConstraintSet {
    let auditor = role == Role::Auditor;
    ConstraintSet {
        min_group_size: Some(ConstraintSet::DEFAULT_MIN_GROUP_SIZE),
        must_mask: Some(true),
        must_redact_narratives: Some(true),
        must_log_access: Some(true),
        max_rows: Some(if auditor { 50 } else { 100 }),
        forbid_export: Some(auditor),
        ..ConstraintSet::default()
    }
}

fn apply_purpose(constraints: &mut ConstraintSet, purpose: Option<Purpose>) {
    match purpose {
        Some(Purpose::Reporting) => constraints.must_aggregate_to_month = Some(true),
        Some(Purpose::Regulatory) => constraints.must_aggregate_to_quarter = Some(true),
        Some(Purpose::Investigation) => {
            constraints.must_log_access = Some(true);
            constraints.forbid_export = Some(true);
            // Caps only tighten: a stricter role-derived limit survives.
            constraints.max_rows = Some(
                constraints
                    .max_rows
                    .map_or(INVESTIGATION_MAX_ROWS, |rows| rows.min(INVESTIGATION_MAX_ROWS)),
            );
        }
        Some(Purpose::Analysis) | None => {}
    }
}

/// Returns whether a `min_group_size` override had to be raised to 1.
fn apply_overrides(constraints: &mut ConstraintSet, overrides: &PolicyOverrides) -> bool {
    let mut raised = false;
    if let Some(min_group_size) = overrides.min_group_size {
        raised = min_group_size == 0;
        constraints.min_group_size = Some(min_group_size.max(1));
    }
    if overrides.forbid_export {
        constraints.forbid_export = Some(true);
    }
    if overrides.mask {
        constraints.must_mask = Some(true);
    }
    if overrides.redact {
        constraints.must_redact_narratives = Some(true);
    }
    if let Some(max_rows) = overrides.max_rows {
        constraints.max_rows = Some(max_rows);
    }
    raised
}

/// Whether an export artifact may be produced for this decision.
pub fn export_allowed(user: &UserAttributes, decision: &PolicyDecision, tier: Sensitivity) -> bool {
    if decision.is_denied() {
        return false;
    }
    let Some(role) = user.role() else {
        return false;
    };
    if role == Role::Auditor && tier == Sensitivity::High {
        return false;
    }
    role_profile(role).can_export && !decision.constraints.forbids_export()
}
