//! Per-feed and per-fact-kind descriptor tables.
//!
//! One generic engine parameterized by these descriptors replaces the
//! per-feed model classes of earlier reporting stacks: each feed declares
//! its fact kinds, their row cardinality, how they are windowed, and how
//! each numeric field folds during aggregation.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Rows allowed per (entity, snapshot) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one row; a rewrite with identical content is a no-op.
    Unique,
    /// Many rows (address mappings, per-owner quota rows under a filesystem).
    Multi,
    /// One row per entity overall, replaced on re-ingest. Completion events
    /// (jobs) use this: they are recorded once, not snapshotted.
    PerEntity,
}

/// Which timestamp scopes a row into a query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBy {
    /// Membership of the row's snapshot in the window.
    Snapshot,
    /// A domain completion timestamp carried on the row itself.
    EventTs,
}

/// How a numeric field folds across rows in a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
    /// Peak of observed samples; usage counters report "currently used",
    /// so the window's peak is the max of samples, never a sum.
    Max,
    /// Smaller-is-worse fields ("free space remaining").
    Min,
    /// Additive completion-event fields (core counts, cpu seconds).
    Sum,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub summary: Summary,
}

#[derive(Debug, Clone, Copy)]
pub struct FactKindSpec {
    pub name: &'static str,
    /// Entity kind the fact's primary reference points at.
    pub entity_kind: &'static str,
    pub cardinality: Cardinality,
    pub window_by: WindowBy,
    pub fields: &'static [FieldSpec],
    /// Link roles used for grouped roll-ups (e.g. owner + queue).
    pub group_roles: &'static [&'static str],
    /// Label whose contiguous run defines the latest-state span.
    pub state_label: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct FeedSpec {
    pub name: &'static str,
    /// Message schema tags this feed accepts; others are skipped.
    pub schemas: &'static [&'static str],
    /// Message-id idempotency: a resend with a seen dedup key is skipped
    /// wholesale (xfs-style).
    pub dedup_by_message: bool,
    /// Skip repeated timestamps within one batch (hcp-style).
    pub dedup_in_batch: bool,
    /// Derive an `allocation` attribute from the numeric suffix of the
    /// primary entity's natural key (hcp namespace naming convention).
    pub derive_allocation: bool,
    pub kinds: &'static [FactKindSpec],
}

impl FeedSpec {
    pub fn kind(&self, name: &str) -> Option<&'static FactKindSpec> {
        self.kinds.iter().find(|kind| kind.name == name)
    }

    pub fn accepts_schema(&self, schema: &str) -> bool {
        self.schemas.iter().any(|s| *s == schema)
    }
}

const fn field(name: &'static str, summary: Summary) -> FieldSpec {
    FieldSpec { name, summary }
}

/// Stock catalog for the source systems this engine reports on.
pub static FEEDS: &[FeedSpec] = &[
    FeedSpec {
        name: "compute",
        schemas: &["compute.instances"],
        dedup_by_message: false,
        dedup_in_batch: false,
        derive_allocation: false,
        kinds: &[
            FactKindSpec {
                name: "instance-state",
                entity_kind: "instance",
                cardinality: Cardinality::Unique,
                window_by: WindowBy::Snapshot,
                fields: &[],
                group_roles: &["tenant"],
                state_label: Some("status"),
            },
            FactKindSpec {
                name: "address-mapping",
                entity_kind: "instance",
                cardinality: Cardinality::Multi,
                window_by: WindowBy::Snapshot,
                fields: &[],
                group_roles: &[],
                state_label: None,
            },
        ],
    },
    FeedSpec {
        name: "xfs",
        schemas: &["xfs.quota.report"],
        dedup_by_message: true,
        dedup_in_batch: false,
        derive_allocation: false,
        kinds: &[FactKindSpec {
            name: "quota-usage",
            entity_kind: "filesystem",
            cardinality: Cardinality::Multi,
            window_by: WindowBy::Snapshot,
            fields: &[
                field("soft", Summary::Max),
                field("hard", Summary::Max),
                field("usage", Summary::Max),
            ],
            group_roles: &["owner"],
            state_label: None,
        }],
    },
    FeedSpec {
        name: "hnas",
        schemas: &["hnas.filesystems"],
        dedup_by_message: false,
        dedup_in_batch: false,
        derive_allocation: false,
        kinds: &[
            FactKindSpec {
                name: "filesystem-usage",
                entity_kind: "filesystem",
                cardinality: Cardinality::Unique,
                window_by: WindowBy::Snapshot,
                fields: &[
                    field("capacity", Summary::Max),
                    field("free", Summary::Min),
                    field("live_usage", Summary::Max),
                    field("snapshot_usage", Summary::Max),
                ],
                group_roles: &[],
                state_label: None,
            },
            FactKindSpec {
                name: "virtual-volume-usage",
                entity_kind: "virtual-volume",
                cardinality: Cardinality::Unique,
                window_by: WindowBy::Snapshot,
                fields: &[
                    field("files", Summary::Max),
                    field("quota", Summary::Max),
                    field("usage", Summary::Max),
                ],
                group_roles: &["owner"],
                state_label: None,
            },
        ],
    },
    FeedSpec {
        name: "hcp",
        schemas: &["hcp.tenants"],
        dedup_by_message: false,
        dedup_in_batch: true,
        derive_allocation: true,
        kinds: &[FactKindSpec {
            name: "namespace-usage",
            entity_kind: "namespace",
            cardinality: Cardinality::Unique,
            window_by: WindowBy::Snapshot,
            fields: &[
                field("ingested_bytes", Summary::Max),
                field("raw_bytes", Summary::Max),
                field("reads", Summary::Max),
                field("writes", Summary::Max),
                field("deletes", Summary::Max),
                field("objects", Summary::Max),
                field("bytes_in", Summary::Max),
                field("bytes_out", Summary::Max),
            ],
            group_roles: &["tenant"],
            state_label: None,
        }],
    },
    FeedSpec {
        name: "swift",
        schemas: &["swift.accounts"],
        dedup_by_message: false,
        dedup_in_batch: false,
        derive_allocation: false,
        kinds: &[FactKindSpec {
            name: "account-usage",
            entity_kind: "account",
            cardinality: Cardinality::Unique,
            window_by: WindowBy::Snapshot,
            fields: &[
                field("bytes", Summary::Max),
                field("containers", Summary::Max),
                field("objects", Summary::Max),
                field("quota", Summary::Max),
            ],
            group_roles: &[],
            state_label: None,
        }],
    },
    FeedSpec {
        name: "cinder",
        schemas: &["cinder.volumes"],
        dedup_by_message: false,
        dedup_in_batch: false,
        derive_allocation: false,
        kinds: &[
            FactKindSpec {
                name: "volume-state",
                entity_kind: "volume",
                cardinality: Cardinality::Unique,
                window_by: WindowBy::Snapshot,
                fields: &[field("size", Summary::Max)],
                group_roles: &["tenant"],
                state_label: Some("status"),
            },
            FactKindSpec {
                name: "volume-attachment",
                entity_kind: "volume",
                cardinality: Cardinality::Multi,
                window_by: WindowBy::Snapshot,
                fields: &[],
                group_roles: &[],
                state_label: None,
            },
        ],
    },
    FeedSpec {
        name: "fs",
        schemas: &["fs.usage"],
        dedup_by_message: false,
        dedup_in_batch: false,
        derive_allocation: false,
        kinds: &[
            FactKindSpec {
                name: "filesystem-usage",
                entity_kind: "filesystem",
                cardinality: Cardinality::Unique,
                window_by: WindowBy::Snapshot,
                fields: &[
                    field("blocks", Summary::Max),
                    field("bavail", Summary::Min),
                    field("bfree", Summary::Min),
                    field("files", Summary::Max),
                ],
                group_roles: &["host"],
                state_label: None,
            },
            FactKindSpec {
                name: "owner-usage",
                entity_kind: "filesystem",
                cardinality: Cardinality::Multi,
                window_by: WindowBy::Snapshot,
                fields: &[
                    field("blocks", Summary::Max),
                    field("bytes", Summary::Max),
                    field("files", Summary::Max),
                ],
                group_roles: &["owner", "project"],
                state_label: None,
            },
        ],
    },
    FeedSpec {
        name: "hpc",
        schemas: &["hpc.job"],
        dedup_by_message: false,
        dedup_in_batch: false,
        derive_allocation: false,
        kinds: &[
            FactKindSpec {
                name: "job",
                entity_kind: "job",
                cardinality: Cardinality::PerEntity,
                window_by: WindowBy::EventTs,
                fields: &[
                    field("cores", Summary::Sum),
                    field("cpu_seconds", Summary::Sum),
                ],
                group_roles: &["owner", "queue"],
                state_label: None,
            },
            FactKindSpec {
                name: "allocation",
                entity_kind: "job",
                cardinality: Cardinality::Multi,
                window_by: WindowBy::EventTs,
                fields: &[field("cores", Summary::Sum)],
                group_roles: &["host"],
                state_label: None,
            },
        ],
    },
];

static FEEDS_BY_NAME: Lazy<HashMap<&'static str, &'static FeedSpec>> =
    Lazy::new(|| FEEDS.iter().map(|feed| (feed.name, feed)).collect());

pub fn feed(name: &str) -> Option<&'static FeedSpec> {
    FEEDS_BY_NAME.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_lookup_finds_stock_feeds() {
        for name in ["compute", "xfs", "hnas", "hcp", "swift", "cinder", "fs", "hpc"] {
            assert!(feed(name).is_some(), "missing feed {name}");
        }
        assert!(feed("tape").is_none());
    }

    #[test]
    fn kind_names_are_unique_within_a_feed() {
        for spec in FEEDS {
            for kind in spec.kinds {
                let count = spec.kinds.iter().filter(|k| k.name == kind.name).count();
                assert_eq!(count, 1, "duplicate kind {} in feed {}", kind.name, spec.name);
            }
        }
    }

    #[test]
    fn event_kinds_carry_sum_fields_only() {
        let job = feed("hpc").unwrap().kind("job").unwrap();
        assert_eq!(job.window_by, WindowBy::EventTs);
        assert!(job.fields.iter().all(|f| f.summary == Summary::Sum));
    }
}
