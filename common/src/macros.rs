/// Declares a uuid-backed row identifier.
///
/// Ids are generated client side so records can be linked before they are
/// persisted, and sort deterministically when a stable order is needed.
#[macro_export]
macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Ord,
            PartialOrd,
            Debug,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn unique() -> $name {
                $name(uuid::Uuid::new_v4())
            }
            pub fn nil() -> $name {
                $name(uuid::Uuid::nil())
            }
            pub const fn from_u128(value: u128) -> $name {
                $name(uuid::Uuid::from_u128(value))
            }
            pub fn is_nil(&self) -> bool {
                self.0 == uuid::Uuid::nil()
            }
            pub fn as_uuid(&self) -> uuid::Uuid {
                self.0
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(uuid: uuid::Uuid) -> $name {
                $name(uuid)
            }
        }

        impl From<$name> for uuid::Uuid {
            fn from(id: $name) -> uuid::Uuid {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(id: &str) -> Result<$name, Self::Err> {
                let uuid = uuid::Uuid::parse_str(id)?;
                Ok($name(uuid))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Default for $name {
            fn default() -> $name {
                $name::nil()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    id_type!(SampleId);

    #[test]
    fn unique_ids_differ_and_parse_back() {
        let a = SampleId::unique();
        let b = SampleId::unique();
        assert_ne!(a, b);
        assert!(!a.is_nil());

        let parsed: SampleId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
    }

    #[test]
    fn default_is_nil() {
        assert!(SampleId::default().is_nil());
        assert!("not-a-uuid".parse::<SampleId>().is_err());
    }
}
