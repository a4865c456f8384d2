//! Typed ID definitions.

use crate::define_id;

define_id!(InstanceId, "inst");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_instance_id_format() {
        let id = InstanceId::new();
        let s = id.to_string();
        assert!(s.starts_with("inst_"));
        assert_eq!(s.len(), 5 + 26);
    }

    #[test]
    fn test_instance_id_parse_errors() {
        assert_eq!(InstanceId::parse(""), Err(IdError::Empty));
        assert_eq!(
            InstanceId::parse("inst01HV4Z4NYPLTRS0JTUA8XDME5F"),
            Err(IdError::MissingSeparator)
        );
        assert!(matches!(
            InstanceId::parse("app_01HV4Z4NYPLTRS0JTUA8XDME5F"),
            Err(IdError::InvalidPrefix { expected: "inst", .. })
        ));
        assert!(matches!(
            InstanceId::parse("inst_not-a-ulid"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_instance_id_as_json_map_key() {
        let id = InstanceId::new();
        let mut map = std::collections::BTreeMap::new();
        map.insert(id, 1u32);

        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<InstanceId, u32> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&id), Some(&1));
    }

    proptest! {
        #[test]
        fn prop_parse_accepts_display(ms in 0u64..(1u64 << 48), rand in any::<u128>()) {
            let id = InstanceId::from_ulid(crate::Ulid::from_parts(ms, rand));
            prop_assert_eq!(InstanceId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
