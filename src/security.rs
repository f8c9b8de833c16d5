//! Security parameters attached to a Preconnection.
//!
//! A fixed table of security knobs in the style of the transport property
//! tables. Today the table carries the ALPN protocol list consumed by the
//! QUIC adapter; values are deep-copied on set so the caller may drop its
//! inputs immediately.

use crate::error::Result;

/// The security knobs the runtime understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProperty {
    Alpn,
}

impl SecurityProperty {
    pub const ALL: [SecurityProperty; 1] = [SecurityProperty::Alpn];

    pub fn wire_name(self) -> &'static str {
        match self {
            SecurityProperty::Alpn => "alpn",
        }
    }
}

/// Type-tagged security parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityPropertyValue {
    StringArray(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SecurityParameterSlot {
    pub set_by_user: bool,
    pub value: SecurityPropertyValue,
}

/// Fixed table of security parameters, indexed by [`SecurityProperty`].
#[derive(Debug, Clone)]
pub struct SecurityParameters {
    slots: [SecurityParameterSlot; SecurityProperty::ALL.len()],
}

impl SecurityParameters {
    /// Copy of the default template: every parameter unset.
    pub fn build() -> Self {
        SecurityParameters {
            slots: [SecurityParameterSlot {
                set_by_user: false,
                value: SecurityPropertyValue::StringArray(Vec::new()),
            }],
        }
    }

    /// Store a string-array parameter, copying every element.
    pub fn set_string_array<S: AsRef<str>>(
        &mut self,
        property: SecurityProperty,
        strings: &[S],
    ) -> Result<()> {
        let slot = &mut self.slots[property as usize];
        match slot.value {
            SecurityPropertyValue::StringArray(_) => {
                slot.value = SecurityPropertyValue::StringArray(
                    strings.iter().map(|s| s.as_ref().to_owned()).collect(),
                );
                slot.set_by_user = true;
                Ok(())
            }
        }
    }

    /// The stored string array, or `None` when the user never set it.
    pub fn string_array(&self, property: SecurityProperty) -> Option<&[String]> {
        let slot = &self.slots[property as usize];
        if !slot.set_by_user {
            return None;
        }
        match &slot.value {
            SecurityPropertyValue::StringArray(strings) => Some(strings),
        }
    }

    /// Convenience accessor for the ALPN protocol list.
    pub fn alpn(&self) -> Option<&[String]> {
        self.string_array(SecurityProperty::Alpn)
    }

    pub fn is_set_by_user(&self, property: SecurityProperty) -> bool {
        self.slots[property as usize].set_by_user
    }
}

impl Default for SecurityParameters {
    fn default() -> Self {
        Self::build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_leaves_every_parameter_unset() {
        let params = SecurityParameters::build();
        assert!(params.alpn().is_none());
        assert!(!params.is_set_by_user(SecurityProperty::Alpn));
    }

    #[test]
    fn set_string_array_copies_inputs() {
        let mut params = SecurityParameters::build();
        let mut input = vec!["simple-ping".to_string()];
        params
            .set_string_array(SecurityProperty::Alpn, &input)
            .unwrap();

        input[0].clear();

        assert_eq!(params.alpn(), Some(&["simple-ping".to_string()][..]));
        assert!(params.is_set_by_user(SecurityProperty::Alpn));
    }

    #[test]
    fn clone_is_independent_of_source() {
        let mut original = SecurityParameters::build();
        original
            .set_string_array(SecurityProperty::Alpn, &["h3"])
            .unwrap();

        let copy = original.clone();
        original
            .set_string_array(SecurityProperty::Alpn, &["other"])
            .unwrap();

        assert_eq!(copy.alpn(), Some(&["h3".to_string()][..]));
    }
}
