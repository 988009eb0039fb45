pub const ENTITIES: &str = "entities";
pub const ENTITY_KEYS: &str = "entity_keys";
pub const SNAPSHOTS: &str = "snapshots";
pub const SNAPSHOT_DEDUP: &str = "snapshot_dedup";
pub const FACTS: &str = "facts";
pub const FACTS_BY_TS: &str = "facts_by_ts";
pub const INPUTS: &str = "inputs";
pub const META: &str = "meta";
