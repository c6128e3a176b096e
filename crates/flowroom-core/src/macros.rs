// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Internal macros.

/// Declares an enum persisted as a short database code and serialized by name.
///
/// The codes are bit-exact with the persisted schema, the names are what the engine
/// and the courier payloads use.
macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = ($code:literal, $label:literal) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $label)] $variant ),+
        }

        impl $name {
            /// The persisted code.
            pub fn code(self) -> &'static str {
                match self {
                    $( Self::$variant => $code ),+
                }
            }

            /// Parses a persisted code.
            pub fn from_code(code: &str) -> Option<Self> {
                match code.trim_end() {
                    $( $code => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// The name used in JSON payloads.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }

            /// Parses a name as used in JSON payloads.
            pub fn parse(label: &str) -> Option<Self> {
                match label {
                    $( $label => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl sqlx::postgres::PgHasArrayType for $name {
            fn array_type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::postgres::PgHasArrayType>::array_type_info()
            }
        }

        impl sqlx::Encode<'_, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> ::std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.code(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> ::std::result::Result<Self, sqlx::error::BoxDynError> {
                let code = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Self::from_code(code).ok_or_else(|| {
                    format!("unknown {} code '{}'", stringify!($name), code).into()
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    // the alias every model module imports
    #[allow(unused_imports)]
    use crate::error::Result;

    code_enum! {
        enum Shade {
            Light = ("L", "light"),
            Dark = ("D", "dark"),
        }
    }

    #[test]
    fn test_code_enum_with_result_alias_in_scope() {
        assert_eq!(Shade::Dark.code(), "D");
        assert_eq!(Shade::from_code("L "), Some(Shade::Light));
        assert_eq!(Shade::parse("dark"), Some(Shade::Dark));
        assert_eq!(Shade::parse("D"), None);
        assert_eq!(Shade::Light.to_string(), "light");
        assert_eq!(serde_json::to_string(&Shade::Dark).unwrap(), r#""dark""#);
        assert_eq!(
            <Shade as sqlx::Type<sqlx::Postgres>>::type_info(),
            <&str as sqlx::Type<sqlx::Postgres>>::type_info()
        );
    }
}
