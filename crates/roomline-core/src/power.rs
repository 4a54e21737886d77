//! Power-level to role resolution.
//!
//! A room's power-level state assigns numeric ranks to users and numeric
//! thresholds to event types and privileged actions. Roles are named
//! tiers layered on top: a role is granted when the user's assigned rank
//! meets every event and action threshold the role template lists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Custom payload message type carried by layer rooms.
pub const OPERATION_MESSAGE_TYPE: &str = "org.roomline.operation";

/// Room scope a role table applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// A payload-carrying layer room.
    Layer,
    /// A project space grouping layer rooms.
    Project,
}

/// Privileged room action gated by a power-level threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Kick,
    Ban,
    Redact,
    Invite,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kick => "kick",
            Self::Ban => "ban",
            Self::Redact => "redact",
            Self::Invite => "invite",
        }
    }
}

/// Raw power-level document of a room.
///
/// Action thresholds stay optional: an absent threshold means the
/// generic `state_default` applies for permission checks, while role
/// matching treats the requirement as unmet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: BTreeMap<String, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub events: BTreeMap<String, i64>,
    #[serde(default)]
    pub events_default: i64,
    #[serde(default = "default_state_level")]
    pub state_default: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kick: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redact: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical: Option<i64>,
}

fn default_state_level() -> i64 {
    50
}

impl Default for PowerLevels {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            users_default: 0,
            events: BTreeMap::new(),
            events_default: 0,
            state_default: default_state_level(),
            ban: None,
            kick: None,
            redact: None,
            invite: None,
            historical: None,
        }
    }
}

impl PowerLevels {
    /// The rank assigned to a user: explicit override, else the room
    /// default.
    pub fn assigned_level(&self, user_id: &str) -> i64 {
        self.users
            .get(user_id)
            .copied()
            .unwrap_or(self.users_default)
    }

    /// The explicit threshold for an action, if the document lists one.
    pub fn action_level(&self, action: Action) -> Option<i64> {
        match action {
            Action::Kick => self.kick,
            Action::Ban => self.ban,
            Action::Redact => self.redact,
            Action::Invite => self.invite,
        }
    }
}

/// A named authorization tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleDefinition {
    pub name: &'static str,
    /// Rank written for this role when granting it to a user.
    pub powerlevel: i64,
    /// Event types the role must be able to send.
    pub events: &'static [&'static str],
    /// Privileged actions the role must be able to perform.
    pub actions: &'static [Action],
}

const LAYER_ROLES: [RoleDefinition; 4] = [
    RoleDefinition {
        name: "OWNER",
        powerlevel: 111,
        events: &["m.room.name", "m.room.power_levels", OPERATION_MESSAGE_TYPE],
        actions: &[Action::Kick, Action::Ban, Action::Redact],
    },
    RoleDefinition {
        name: "ADMINISTRATOR",
        powerlevel: 100,
        events: &["m.room.name", "m.room.power_levels", OPERATION_MESSAGE_TYPE],
        actions: &[Action::Kick, Action::Ban, Action::Redact],
    },
    RoleDefinition {
        name: "CONTRIBUTOR",
        powerlevel: 25,
        events: &[OPERATION_MESSAGE_TYPE],
        actions: &[],
    },
    RoleDefinition {
        name: "READER",
        powerlevel: 0,
        events: &[],
        actions: &[],
    },
];

const PROJECT_ROLES: [RoleDefinition; 4] = [
    RoleDefinition {
        name: "OWNER",
        powerlevel: 111,
        events: &["m.room.name", "m.room.power_levels", "m.space.child"],
        actions: &[Action::Kick, Action::Ban, Action::Redact, Action::Invite],
    },
    RoleDefinition {
        name: "ADMINISTRATOR",
        powerlevel: 100,
        events: &["m.room.name", "m.room.power_levels", "m.space.child"],
        actions: &[Action::Kick, Action::Ban, Action::Redact, Action::Invite],
    },
    RoleDefinition {
        name: "CONTRIBUTOR",
        powerlevel: 25,
        events: &["m.room.name", "m.space.child"],
        actions: &[],
    },
    RoleDefinition {
        name: "READER",
        powerlevel: 0,
        events: &[],
        actions: &[],
    },
];

/// Role table for a scope, ordered by descending threshold. The last
/// entry has empty requirement sets and therefore always matches.
pub fn roles(scope: Scope) -> &'static [RoleDefinition] {
    match scope {
        Scope::Layer => &LAYER_ROLES,
        Scope::Project => &PROJECT_ROLES,
    }
}

/// Result of resolving a user against a room's power-level state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The highest tier whose requirements the user meets.
    pub role: &'static RoleDefinition,
    /// The tier matching the room's default user rank, if any tier's
    /// written rank equals it.
    pub default_role: Option<&'static RoleDefinition>,
    /// Copy of the explicit per-user overrides.
    pub users: BTreeMap<String, i64>,
}

/// Resolve the highest role a user qualifies for in the given scope.
///
/// Walks the scope's roles in descending order and returns the first
/// role whose every event threshold and every action threshold is met by
/// the user's assigned rank. Total: the lowest tier always matches.
pub fn resolve_role(user_id: &str, power_levels: &PowerLevels, scope: Scope) -> Resolution {
    let assigned = power_levels.assigned_level(user_id);
    let definitions = roles(scope);

    let role = definitions
        .iter()
        .find(|role| meets_requirements(role, assigned, power_levels))
        .unwrap_or(&definitions[definitions.len() - 1]);

    let default_role = definitions
        .iter()
        .find(|role| role.powerlevel == power_levels.users_default);

    Resolution {
        role,
        default_role,
        users: power_levels.users.clone(),
    }
}

fn meets_requirements(role: &RoleDefinition, assigned: i64, power_levels: &PowerLevels) -> bool {
    // A threshold the document does not list counts as unmet; only the
    // lowest tier's empty requirement sets are vacuously satisfied.
    let events = role.events.iter().all(|event_type| {
        power_levels
            .events
            .get(*event_type)
            .is_some_and(|threshold| assigned >= *threshold)
    });
    let actions = role.actions.iter().all(|action| {
        power_levels
            .action_level(*action)
            .is_some_and(|threshold| assigned >= threshold)
    });

    events && actions
}

/// Whether a user may perform a single privileged action.
///
/// The required rank is the action-specific threshold when the document
/// lists one, else the generic state-change threshold. No role lookup is
/// involved.
pub fn can_execute(user_id: &str, action: Action, power_levels: &PowerLevels) -> bool {
    let required = power_levels
        .action_level(action)
        .unwrap_or(power_levels.state_default);
    power_levels.assigned_level(user_id) >= required
}

/// Invite/kick/ban capability map for UI callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub invite: bool,
    pub kick: bool,
    pub ban: bool,
}

pub fn permissions(user_id: &str, power_levels: &PowerLevels) -> Permissions {
    Permissions {
        invite: can_execute(user_id, Action::Invite, power_levels),
        kick: can_execute(user_id, Action::Kick, power_levels),
        ban: can_execute(user_id, Action::Ban, power_levels),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn room_power_levels() -> PowerLevels {
        serde_json::from_value(json!({
            "users": {
                "@alpha:domain.tld": 100,
                "@beta:domain.tld": 50,
                "@gamma:domain.tld": 0
            },
            "users_default": 0,
            "events": {
                "m.room.name": 50,
                "m.room.power_levels": 100,
                "m.room.history_visibility": 100,
                "m.space.child": 50,
                "m.room.topic": 50
            },
            "events_default": 0,
            "state_default": 50,
            "ban": 50,
            "kick": 50,
            "redact": 50,
            "invite": 0,
            "historical": 100
        }))
        .expect("power-level document should deserialize")
    }

    fn layer_power_levels() -> PowerLevels {
        serde_json::from_value(json!({
            "users": {
                "@owner:domain.tld": 111,
                "@admin:domain.tld": 100,
                "@writer:domain.tld": 25
            },
            "users_default": 0,
            "events": {
                "m.room.name": 25,
                "m.room.power_levels": 100,
                "org.roomline.operation": 25
            },
            "events_default": 100,
            "state_default": 100,
            "ban": 100,
            "kick": 100,
            "redact": 100,
            "invite": 100
        }))
        .expect("power-level document should deserialize")
    }

    #[test]
    fn unlisted_user_falls_back_to_room_default() {
        let levels = room_power_levels();
        assert!(can_execute("@delta:domain.tld", Action::Invite, &levels));
        assert!(!can_execute("@delta:domain.tld", Action::Kick, &levels));
        assert!(!can_execute("@delta:domain.tld", Action::Ban, &levels));
    }

    #[test]
    fn listed_user_at_zero_matches_room_default_capabilities() {
        let levels = room_power_levels();
        assert!(can_execute("@gamma:domain.tld", Action::Invite, &levels));
        assert!(!can_execute("@gamma:domain.tld", Action::Kick, &levels));
        assert!(!can_execute("@gamma:domain.tld", Action::Ban, &levels));
    }

    #[test]
    fn listed_user_at_fifty_may_moderate() {
        let levels = room_power_levels();
        assert!(can_execute("@beta:domain.tld", Action::Invite, &levels));
        assert!(can_execute("@beta:domain.tld", Action::Kick, &levels));
        assert!(can_execute("@beta:domain.tld", Action::Ban, &levels));
    }

    #[test]
    fn missing_action_threshold_falls_back_to_state_default() {
        let mut levels = room_power_levels();
        levels.redact = None;
        assert!(can_execute("@beta:domain.tld", Action::Redact, &levels));
        assert!(!can_execute("@gamma:domain.tld", Action::Redact, &levels));
    }

    #[test]
    fn permissions_map_matches_single_action_checks() {
        let result = permissions("@delta:domain.tld", &room_power_levels());
        assert_eq!(
            result,
            Permissions {
                invite: true,
                kick: false,
                ban: false
            }
        );
    }

    #[test]
    fn resolves_owner_for_full_rank() {
        let resolution = resolve_role("@owner:domain.tld", &layer_power_levels(), Scope::Layer);
        assert_eq!(resolution.role.name, "OWNER");
        assert_eq!(
            resolution.default_role.map(|role| role.name),
            Some("READER")
        );
        assert_eq!(resolution.users.get("@writer:domain.tld"), Some(&25));
    }

    #[test]
    fn resolves_contributor_when_moderation_is_out_of_reach() {
        let resolution = resolve_role("@writer:domain.tld", &layer_power_levels(), Scope::Layer);
        assert_eq!(resolution.role.name, "CONTRIBUTOR");
    }

    #[test]
    fn resolves_reader_for_unknown_user() {
        let resolution = resolve_role("@nobody:domain.tld", &layer_power_levels(), Scope::Layer);
        assert_eq!(resolution.role.name, "READER");
    }

    #[test]
    fn resolution_is_total_for_empty_documents() {
        let empty = PowerLevels::default();
        let resolution = resolve_role("@anyone:domain.tld", &empty, Scope::Project);
        assert_eq!(resolution.role.name, "READER");
        // Idempotent: resolving again yields the same tier.
        let again = resolve_role("@anyone:domain.tld", &empty, Scope::Project);
        assert_eq!(resolution.role, again.role);
    }

    #[test]
    fn per_type_thresholds_override_the_role_rank() {
        // Renames require 111 here, so a rank-100 user fails the
        // ADMINISTRATOR template despite meeting its written rank.
        let mut levels = layer_power_levels();
        levels.events.insert("m.room.name".to_owned(), 111);
        let resolution = resolve_role("@admin:domain.tld", &levels, Scope::Layer);
        assert_eq!(resolution.role.name, "CONTRIBUTOR");
    }

    #[test]
    fn role_requiring_unlisted_event_type_never_matches() {
        let mut levels = layer_power_levels();
        levels.events.remove(OPERATION_MESSAGE_TYPE);
        let resolution = resolve_role("@owner:domain.tld", &levels, Scope::Layer);
        assert_eq!(resolution.role.name, "READER");
    }

    #[test]
    fn can_execute_agrees_with_role_action_thresholds() {
        let levels = layer_power_levels();
        // ADMINISTRATOR requires kick at 100.
        assert!(can_execute("@admin:domain.tld", Action::Kick, &levels));
        assert!(!can_execute("@writer:domain.tld", Action::Kick, &levels));
        let resolution = resolve_role("@admin:domain.tld", &levels, Scope::Layer);
        assert!(resolution.role.actions.contains(&Action::Kick));
    }
}
