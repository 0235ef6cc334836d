//! Static MITRE ATT&CK lookup.
//!
//! Detection technique ids map to a (tactic, technique) pair. Ids with no
//! entry resolve to the `Unclassified` tactic instead of failing.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// ATT&CK tactic (kill-chain phase) plus a fallback for unmapped techniques.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitreTactic {
    ResourceDevelopment,
    InitialAccess,
    Persistence,
    DefenseEvasion,
    CredentialAccess,
    LateralMovement,
    Unclassified,
}

impl MitreTactic {
    pub fn id(&self) -> &'static str {
        match self {
            Self::ResourceDevelopment => "TA0042",
            Self::InitialAccess => "TA0001",
            Self::Persistence => "TA0003",
            Self::DefenseEvasion => "TA0005",
            Self::CredentialAccess => "TA0006",
            Self::LateralMovement => "TA0008",
            Self::Unclassified => "TA0000",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ResourceDevelopment => "Resource Development",
            Self::InitialAccess => "Initial Access",
            Self::Persistence => "Persistence",
            Self::DefenseEvasion => "Defense Evasion",
            Self::CredentialAccess => "Credential Access",
            Self::LateralMovement => "Lateral Movement",
            Self::Unclassified => "Unclassified",
        }
    }
}

impl fmt::Display for MitreTactic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MitreMapping {
    pub technique_id: String,
    pub technique_name: String,
    pub tactic: MitreTactic,
    pub description: String,
}

impl MitreMapping {
    pub fn url(&self) -> Option<String> {
        if self.tactic == MitreTactic::Unclassified {
            return None;
        }
        Some(format!(
            "https://attack.mitre.org/techniques/{}/",
            self.technique_id.replace('.', "/")
        ))
    }
}

fn entry(id: &str, name: &str, tactic: MitreTactic, description: &str) -> MitreMapping {
    MitreMapping {
        technique_id: id.to_string(),
        technique_name: name.to_string(),
        tactic,
        description: description.to_string(),
    }
}

/// Detection technique id to ATT&CK mapping.
pub static MITRE_TABLE: Lazy<BTreeMap<&'static str, MitreMapping>> = Lazy::new(|| {
    let mut m = BTreeMap::new();

    m.insert(
        "brute-force",
        entry(
            "T1110",
            "Brute Force",
            MitreTactic::CredentialAccess,
            "Systematic password guessing against one or more accounts.",
        ),
    );
    m.insert(
        "credential-stuffing",
        entry(
            "T1110.004",
            "Credential Stuffing",
            MitreTactic::CredentialAccess,
            "Previously leaked credential pairs replayed across many accounts.",
        ),
    );
    m.insert(
        "botnet",
        entry(
            "T1583.005",
            "Botnet",
            MitreTactic::ResourceDevelopment,
            "Many hosts issuing near-identical requests under common control.",
        ),
    );
    m.insert(
        "geo-anomaly",
        entry(
            "T1078",
            "Valid Accounts",
            MitreTactic::InitialAccess,
            "One account used from an implausible spread of locations.",
        ),
    );
    m.insert(
        "account-manipulation",
        entry(
            "T1098",
            "Account Manipulation",
            MitreTactic::Persistence,
            "Accounts altered to maintain access.",
        ),
    );
    m.insert(
        "remote-services",
        entry(
            "T1021",
            "Remote Services",
            MitreTactic::LateralMovement,
            "Remote services used to move between hosts.",
        ),
    );

    m
});

/// Map a detection technique id. Unknown ids map to `Unclassified`.
pub fn lookup(technique: &str) -> MitreMapping {
    match MITRE_TABLE.get(technique) {
        Some(m) => m.clone(),
        None => MitreMapping {
            technique_id: technique.to_string(),
            technique_name: "Unclassified".to_string(),
            tactic: MitreTactic::Unclassified,
            description: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_techniques() {
        let bf = lookup("brute-force");
        assert_eq!(bf.technique_id, "T1110");
        assert_eq!(bf.tactic.id(), "TA0006");
        assert_eq!(
            lookup("credential-stuffing").url().as_deref(),
            Some("https://attack.mitre.org/techniques/T1110/004/")
        );
        assert_eq!(lookup("geo-anomaly").technique_id, "T1078");
    }

    #[test]
    fn unknown_is_unclassified() {
        let m = lookup("port-knocking");
        assert_eq!(m.tactic, MitreTactic::Unclassified);
        assert_eq!(m.technique_id, "port-knocking");
        assert!(m.url().is_none());
    }
}
