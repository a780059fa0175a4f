//! Denormalization validator: recompute the access tables from scratch
//! and compare against the stored ref counts. Run periodically as a
//! consistency check; with `repair` the stored counts are overwritten.

use std::collections::HashMap;

use trellis_domain::model::PolicyType;
use trellis_domain::Result;

use crate::store::links::RefCountedLinkCollection;
use crate::store::{LinkCollection, Stores, Tx};

/// A single count mismatch found by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    pub table: &'static str,
    pub a: String,
    pub b: String,
    pub expected: u32,
    pub actual: u32,
    pub repaired: bool,
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: link count for {} <-> {} is {}, should be {}{}",
            self.table,
            self.a,
            self.b,
            self.actual,
            self.expected,
            if self.repaired { " (repaired)" } else { "" }
        )
    }
}

fn expected_counts(
    stores: &Stores,
    tx: &Tx,
    policy_type: PolicyType,
    side: &LinkCollection,
) -> Result<HashMap<(String, String), u32>> {
    let mut expected: HashMap<(String, String), u32> = HashMap::new();
    for policy in stores.service_policies.all(tx) {
        if policy.policy_type != policy_type {
            continue;
        }
        let sources = side.iterate_links(tx, &policy.id);
        let services = stores.policy_services.iterate_links(tx, &policy.id);
        for source in &sources {
            for service in &services {
                *expected
                    .entry((source.clone(), service.clone()))
                    .or_default() += 1;
            }
        }
    }
    Ok(expected)
}

fn check_table(
    tx: &mut Tx,
    name: &'static str,
    table: &RefCountedLinkCollection,
    expected: HashMap<(String, String), u32>,
    repair: bool,
    findings: &mut Vec<Discrepancy>,
) -> Result<()> {
    let mut actual: HashMap<(String, String), u32> = table
        .all_counts(tx)
        .into_iter()
        .map(|(a, b, count)| ((a, b), count))
        .collect();

    for ((a, b), want) in expected {
        let have = actual.remove(&(a.clone(), b.clone())).unwrap_or(0);
        if have != want {
            if repair {
                table.set_link_count(tx, &a, &b, want)?;
            }
            findings.push(Discrepancy {
                table: name,
                a,
                b,
                expected: want,
                actual: have,
                repaired: repair,
            });
        }
    }
    // Whatever remains should not exist at all.
    for ((a, b), have) in actual {
        if repair {
            table.set_link_count(tx, &a, &b, 0)?;
        }
        findings.push(Discrepancy {
            table: name,
            a,
            b,
            expected: 0,
            actual: have,
            repaired: repair,
        });
    }
    Ok(())
}

/// Validate all four denorm tables. Returns every discrepancy found;
/// with `repair` the stored counts are overwritten with the recomputed
/// ones.
pub fn validate_denormalization(
    stores: &Stores,
    tx: &mut Tx,
    repair: bool,
) -> Result<Vec<Discrepancy>> {
    let mut findings = Vec::new();

    let tables: [(&'static str, &RefCountedLinkCollection, PolicyType, &LinkCollection); 4] = [
        (
            "identity-dial-services",
            &stores.identity_dial_services,
            PolicyType::Dial,
            &stores.policy_identities,
        ),
        (
            "identity-bind-services",
            &stores.identity_bind_services,
            PolicyType::Bind,
            &stores.policy_identities,
        ),
        (
            "posture-dial-services",
            &stores.posture_dial_services,
            PolicyType::Dial,
            &stores.policy_posture_checks,
        ),
        (
            "posture-bind-services",
            &stores.posture_bind_services,
            PolicyType::Bind,
            &stores.policy_posture_checks,
        ),
    ];

    for (name, table, policy_type, side) in tables {
        let expected = expected_counts(stores, tx, policy_type, side)?;
        check_table(tx, name, table, expected, repair, &mut findings)?;
    }

    for finding in &findings {
        tracing::warn!(%finding, "denormalization discrepancy");
    }
    Ok(findings)
}
