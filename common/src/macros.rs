/// Declares a uuid-backed identifier newtype.
///
/// The caller crate needs `serde` in scope for the derives.
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
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name($crate::uuid::Uuid);

        impl $name {
            pub fn unique() -> $name {
                $name($crate::uuid::Uuid::new_v4())
            }
            pub fn nil() -> $name {
                $name($crate::uuid::Uuid::nil())
            }
            pub const fn from_u128(value: u128) -> $name {
                $name($crate::uuid::Uuid::from_u128(value))
            }
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
            pub fn as_uuid(&self) -> $crate::uuid::Uuid {
                self.0
            }
            /// Hyphen-less form, safe to use as a directory or file name.
            pub fn simple(&self) -> String {
                self.0.simple().to_string()
            }
        }

        impl From<$crate::uuid::Uuid> for $name {
            fn from(uuid: $crate::uuid::Uuid) -> $name {
                $name(uuid)
            }
        }

        impl From<u128> for $name {
            fn from(value: u128) -> $name {
                $name::from_u128(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::uuid::Error;

            fn from_str(id: &str) -> std::result::Result<$name, Self::Err> {
                $crate::uuid::Uuid::parse_str(id).map($name)
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
