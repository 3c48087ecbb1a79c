//! Session configuration (§6 "Configuration", ambient). Grounded on the
//! teacher's config-struct-with-`Default`-impl style rather than a
//! builder, since every field here already has a spec-documented default.

use crate::engine::TransactionKind;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub transaction_kind: TransactionKind,
    pub id_range_size: u32,
    pub id_range_request: u32,
    pub id_refill_water_mark: f64,
    pub cascade_local_threshold: u32,
    pub change_list_initial_capacity: u32,
    pub buffer_string_pool_initial: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            transaction_kind: TransactionKind::ReadWrite,
            id_range_size: 5_000_000,
            id_range_request: 1_000,
            id_refill_water_mark: 0.4,
            cascade_local_threshold: 4,
            change_list_initial_capacity: 8192,
            buffer_string_pool_initial: 8192,
        }
    }
}

impl SessionConfig {
    pub fn read_only() -> Self {
        SessionConfig { transaction_kind: TransactionKind::Read, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.id_range_size, 5_000_000);
        assert_eq!(cfg.cascade_local_threshold, 4);
        assert!((cfg.id_refill_water_mark - 0.4).abs() < f64::EPSILON);
    }
}
