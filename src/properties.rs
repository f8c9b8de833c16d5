//! # Transport Property Model
//!
//! Typed, defaulted property bags that drive protocol selection and
//! per-connection behavior, mirroring the property vocabulary of RFC 9622.
//!
//! Three categories exist, each a fixed, enum-indexed table built from a
//! constant default template:
//!
//! - **Selection properties**: categorical preferences (`Prohibit` ..
//!   `Require`) consumed by the candidate-gathering engine to filter and
//!   rank protocol stacks.
//! - **Connection properties**: scalar knobs plus the connection `State`.
//! - **Message properties**: per-message overlays (lifetime, priority,
//!   ordering, ...) carried by a `MessageContext` on each send.
//!
//! Every slot tracks whether the user set it (`set_by_user`); an unset slot
//! holds the default and may be overridden by inheritance from a Listener or
//! Preconnection. All property bags are plain `Clone` values; cloning is the
//! deep copy the API boundary requires, so mutating a source after a copy
//! never affects the destination.

use crate::defaults;

/// Strength of a selection-property preference, ordered weakest to
/// strongest influence on candidate filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preference {
    /// Candidate stacks providing the property are excluded.
    Prohibit,
    /// Providing stacks are ranked below non-providing ones.
    Avoid,
    /// The property does not influence selection.
    #[default]
    NoPreference,
    /// Providing stacks are ranked above non-providing ones.
    Prefer,
    /// Candidate stacks not providing the property are excluded.
    Require,
}

/// The selection properties evaluated against protocol capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionProperty {
    Reliability,
    PreserveOrder,
    PreserveMsgBoundaries,
    Multistreaming,
    CongestionControl,
}

impl SelectionProperty {
    pub const ALL: [SelectionProperty; 5] = [
        SelectionProperty::Reliability,
        SelectionProperty::PreserveOrder,
        SelectionProperty::PreserveMsgBoundaries,
        SelectionProperty::Multistreaming,
        SelectionProperty::CongestionControl,
    ];

    /// RFC 9622 wire name for the property.
    pub fn wire_name(self) -> &'static str {
        match self {
            SelectionProperty::Reliability => "reliability",
            SelectionProperty::PreserveOrder => "preserveOrder",
            SelectionProperty::PreserveMsgBoundaries => "preserveMsgBoundaries",
            SelectionProperty::Multistreaming => "multistreaming",
            SelectionProperty::CongestionControl => "congestionControl",
        }
    }
}

/// One selection-property slot: the preference plus its provenance.
#[derive(Debug, Clone, Copy)]
pub struct PreferenceSlot {
    pub set_by_user: bool,
    pub value: Preference,
}

const DEFAULT_PREFERENCE_SLOT: PreferenceSlot = PreferenceSlot {
    set_by_user: false,
    value: Preference::NoPreference,
};

/// Fixed table of selection preferences, indexed by [`SelectionProperty`].
#[derive(Debug, Clone)]
pub struct SelectionProperties {
    slots: [PreferenceSlot; SelectionProperty::ALL.len()],
}

impl SelectionProperties {
    /// Copy of the default template: every property at `NoPreference`.
    pub fn build() -> Self {
        SelectionProperties {
            slots: [DEFAULT_PREFERENCE_SLOT; SelectionProperty::ALL.len()],
        }
    }

    pub fn preference(&self, property: SelectionProperty) -> Preference {
        self.slots[property as usize].value
    }

    pub fn is_set_by_user(&self, property: SelectionProperty) -> bool {
        self.slots[property as usize].set_by_user
    }

    pub fn set_preference(&mut self, property: SelectionProperty, value: Preference) {
        self.slots[property as usize] = PreferenceSlot {
            set_by_user: true,
            value,
        };
    }
}

impl Default for SelectionProperties {
    fn default() -> Self {
        Self::build()
    }
}

/// Lifecycle state of a connection, exposed through the `State`
/// connection property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Establishing,
    Ready,
    Closing,
    Closed,
    Errored,
}

/// The scalar connection properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionProperty {
    State,
    ConnPriority,
    ConnTimeout,
}

impl ConnectionProperty {
    pub const ALL: [ConnectionProperty; 3] = [
        ConnectionProperty::State,
        ConnectionProperty::ConnPriority,
        ConnectionProperty::ConnTimeout,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            ConnectionProperty::State => "state",
            ConnectionProperty::ConnPriority => "connPriority",
            ConnectionProperty::ConnTimeout => "connTimeout",
        }
    }
}

/// Type-tagged connection property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPropertyValue {
    State(ConnectionState),
    Integer(i32),
    Uint64(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionPropertySlot {
    pub set_by_user: bool,
    pub value: ConnectionPropertyValue,
}

const DEFAULT_CONNECTION_SLOTS: [ConnectionPropertySlot; ConnectionProperty::ALL.len()] = [
    ConnectionPropertySlot {
        set_by_user: false,
        value: ConnectionPropertyValue::State(ConnectionState::Establishing),
    },
    ConnectionPropertySlot {
        set_by_user: false,
        value: ConnectionPropertyValue::Integer(defaults::DEFAULT_CONN_PRIORITY),
    },
    ConnectionPropertySlot {
        set_by_user: false,
        value: ConnectionPropertyValue::Uint64(defaults::TIMEOUT_DISABLED),
    },
];

/// Fixed table of connection properties, indexed by [`ConnectionProperty`].
#[derive(Debug, Clone)]
pub struct ConnectionProperties {
    slots: [ConnectionPropertySlot; ConnectionProperty::ALL.len()],
}

impl ConnectionProperties {
    pub fn build() -> Self {
        ConnectionProperties {
            slots: DEFAULT_CONNECTION_SLOTS,
        }
    }

    pub fn value(&self, property: ConnectionProperty) -> ConnectionPropertyValue {
        self.slots[property as usize].value
    }

    pub fn state(&self) -> ConnectionState {
        match self.slots[ConnectionProperty::State as usize].value {
            ConnectionPropertyValue::State(state) => state,
            // The state slot only ever holds a state value.
            _ => ConnectionState::Establishing,
        }
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.slots[ConnectionProperty::State as usize].value =
            ConnectionPropertyValue::State(state);
    }
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self::build()
    }
}

/// The transport properties carried by Preconnections, Listeners and
/// Connections: selection preferences plus connection-level scalars.
#[derive(Debug, Clone, Default)]
pub struct TransportProperties {
    selection: SelectionProperties,
    connection: ConnectionProperties,
}

impl TransportProperties {
    /// Copy of the default template for both categories.
    pub fn build() -> Self {
        TransportProperties {
            selection: SelectionProperties::build(),
            connection: ConnectionProperties::build(),
        }
    }

    pub fn selection(&self) -> &SelectionProperties {
        &self.selection
    }

    pub fn connection(&self) -> &ConnectionProperties {
        &self.connection
    }

    /// Record a selection preference, marking the slot user-set.
    pub fn set_selection_preference(&mut self, property: SelectionProperty, value: Preference) {
        self.selection.set_preference(property, value);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub(crate) fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection.set_state(state);
    }
}

/// Capacity profile hint carried by the `msgCapacityProfile` message
/// property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityProfile {
    #[default]
    BestEffort,
    Scavenger,
    LowLatencyInteractive,
    LowLatencyNonInteractive,
    ConstantRateStreaming,
    CapacitySeeking,
}

/// The per-message properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageProperty {
    Lifetime,
    Priority,
    Ordered,
    SafelyReplayable,
    Final,
    ChecksumLen,
    Reliable,
    CapacityProfile,
    NoFragmentation,
    NoSegmentation,
}

impl MessageProperty {
    pub const ALL: [MessageProperty; 10] = [
        MessageProperty::Lifetime,
        MessageProperty::Priority,
        MessageProperty::Ordered,
        MessageProperty::SafelyReplayable,
        MessageProperty::Final,
        MessageProperty::ChecksumLen,
        MessageProperty::Reliable,
        MessageProperty::CapacityProfile,
        MessageProperty::NoFragmentation,
        MessageProperty::NoSegmentation,
    ];

    /// RFC 9622 wire name for the property.
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageProperty::Lifetime => "msgLifetime",
            MessageProperty::Priority => "msgPriority",
            MessageProperty::Ordered => "msgOrdered",
            MessageProperty::SafelyReplayable => "safelyReplayable",
            MessageProperty::Final => "final",
            MessageProperty::ChecksumLen => "msgChecksumLen",
            MessageProperty::Reliable => "msgReliable",
            MessageProperty::CapacityProfile => "msgCapacityProfile",
            MessageProperty::NoFragmentation => "noFragmentation",
            MessageProperty::NoSegmentation => "noSegmentation",
        }
    }
}

/// Type-tagged message property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePropertyValue {
    Uint64(u64),
    Integer(u32),
    Boolean(bool),
    Priority(i32),
    CapacityProfile(CapacityProfile),
}

#[derive(Debug, Clone, Copy)]
pub struct MessagePropertySlot {
    pub set_by_user: bool,
    pub value: MessagePropertyValue,
}

const DEFAULT_MESSAGE_SLOTS: [MessagePropertySlot; MessageProperty::ALL.len()] = [
    // msgLifetime
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Uint64(defaults::MSG_LIFETIME_INFINITE),
    },
    // msgPriority
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Priority(defaults::DEFAULT_MSG_PRIORITY),
    },
    // msgOrdered
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Boolean(true),
    },
    // safelyReplayable
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Boolean(false),
    },
    // final
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Boolean(false),
    },
    // msgChecksumLen
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Integer(defaults::MSG_CHECKSUM_FULL_COVERAGE),
    },
    // msgReliable
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Boolean(true),
    },
    // msgCapacityProfile
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::CapacityProfile(CapacityProfile::BestEffort),
    },
    // noFragmentation
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Boolean(false),
    },
    // noSegmentation
    MessagePropertySlot {
        set_by_user: false,
        value: MessagePropertyValue::Boolean(false),
    },
];

/// Fixed table of message properties, indexed by [`MessageProperty`].
///
/// Built standalone per send (inside a `MessageContext`) or inherited from
/// connection defaults.
#[derive(Debug, Clone)]
pub struct MessageProperties {
    slots: [MessagePropertySlot; MessageProperty::ALL.len()],
}

impl MessageProperties {
    /// Copy of the default template.
    pub fn build() -> Self {
        MessageProperties {
            slots: DEFAULT_MESSAGE_SLOTS,
        }
    }

    pub fn value(&self, property: MessageProperty) -> MessagePropertyValue {
        self.slots[property as usize].value
    }

    pub fn is_set_by_user(&self, property: MessageProperty) -> bool {
        self.slots[property as usize].set_by_user
    }

    /// Store a value, rejecting type mismatches against the slot's tag.
    pub fn set(
        &mut self,
        property: MessageProperty,
        value: MessagePropertyValue,
    ) -> crate::error::Result<()> {
        let slot = &mut self.slots[property as usize];
        if std::mem::discriminant(&slot.value) != std::mem::discriminant(&value) {
            return Err(crate::error::TapsError::InvalidArgument(
                "message property value type does not match the property",
            ));
        }
        slot.value = value;
        slot.set_by_user = true;
        Ok(())
    }

    fn boolean(&self, property: MessageProperty) -> bool {
        match self.slots[property as usize].value {
            MessagePropertyValue::Boolean(b) => b,
            _ => false,
        }
    }

    /// Lifetime in milliseconds; `MSG_LIFETIME_INFINITE` means no deadline.
    pub fn lifetime(&self) -> u64 {
        match self.slots[MessageProperty::Lifetime as usize].value {
            MessagePropertyValue::Uint64(v) => v,
            _ => defaults::MSG_LIFETIME_INFINITE,
        }
    }

    pub fn set_lifetime(&mut self, millis: u64) {
        self.slots[MessageProperty::Lifetime as usize] = MessagePropertySlot {
            set_by_user: true,
            value: MessagePropertyValue::Uint64(millis),
        };
    }

    pub fn priority(&self) -> i32 {
        match self.slots[MessageProperty::Priority as usize].value {
            MessagePropertyValue::Priority(v) => v,
            _ => defaults::DEFAULT_MSG_PRIORITY,
        }
    }

    pub fn ordered(&self) -> bool {
        self.boolean(MessageProperty::Ordered)
    }

    pub fn reliable(&self) -> bool {
        self.boolean(MessageProperty::Reliable)
    }

    pub fn capacity_profile(&self) -> CapacityProfile {
        match self.slots[MessageProperty::CapacityProfile as usize].value {
            MessagePropertyValue::CapacityProfile(profile) => profile,
            _ => CapacityProfile::BestEffort,
        }
    }

    /// Whether this message is the last one on its connection.
    pub fn is_final(&self) -> bool {
        self.boolean(MessageProperty::Final)
    }

    /// Mark this message as the last one on its connection.
    pub fn set_final(&mut self) {
        self.slots[MessageProperty::Final as usize] = MessagePropertySlot {
            set_by_user: true,
            value: MessagePropertyValue::Boolean(true),
        };
    }
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self::build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_properties_default_to_no_preference() {
        let props = SelectionProperties::build();
        for property in SelectionProperty::ALL {
            assert_eq!(props.preference(property), Preference::NoPreference);
            assert!(!props.is_set_by_user(property));
        }
    }

    #[test]
    fn set_preference_marks_slot_user_set() {
        let mut props = SelectionProperties::build();
        props.set_preference(SelectionProperty::Reliability, Preference::Require);

        assert_eq!(
            props.preference(SelectionProperty::Reliability),
            Preference::Require
        );
        assert!(props.is_set_by_user(SelectionProperty::Reliability));
        assert!(!props.is_set_by_user(SelectionProperty::Multistreaming));
    }

    #[test]
    fn message_properties_build_initializes_defaults() {
        let props = MessageProperties::build();

        assert_eq!(props.lifetime(), defaults::MSG_LIFETIME_INFINITE);
        assert_eq!(props.priority(), 100);
        assert!(props.ordered());
        assert!(props.reliable());
        assert!(!props.is_final());
        assert_eq!(props.capacity_profile(), CapacityProfile::BestEffort);
        assert_eq!(
            props.value(MessageProperty::ChecksumLen),
            MessagePropertyValue::Integer(defaults::MSG_CHECKSUM_FULL_COVERAGE)
        );
        assert_eq!(
            props.value(MessageProperty::SafelyReplayable),
            MessagePropertyValue::Boolean(false)
        );
        for property in MessageProperty::ALL {
            assert!(!props.is_set_by_user(property));
        }
    }

    #[test]
    fn message_property_wire_names_match_rfc_9622() {
        assert_eq!(MessageProperty::Lifetime.wire_name(), "msgLifetime");
        assert_eq!(MessageProperty::Priority.wire_name(), "msgPriority");
        assert_eq!(MessageProperty::Ordered.wire_name(), "msgOrdered");
        assert_eq!(
            MessageProperty::SafelyReplayable.wire_name(),
            "safelyReplayable"
        );
        assert_eq!(MessageProperty::Final.wire_name(), "final");
        assert_eq!(MessageProperty::ChecksumLen.wire_name(), "msgChecksumLen");
        assert_eq!(MessageProperty::Reliable.wire_name(), "msgReliable");
        assert_eq!(
            MessageProperty::CapacityProfile.wire_name(),
            "msgCapacityProfile"
        );
        assert_eq!(
            MessageProperty::NoFragmentation.wire_name(),
            "noFragmentation"
        );
        assert_eq!(MessageProperty::NoSegmentation.wire_name(), "noSegmentation");
    }

    #[test]
    fn set_final_round_trips() {
        let mut props = MessageProperties::build();
        assert!(!props.is_final());

        props.set_final();

        assert!(props.is_final());
        assert!(props.is_set_by_user(MessageProperty::Final));
    }

    #[test]
    fn set_rejects_mismatched_value_type() {
        let mut props = MessageProperties::build();
        let result = props.set(
            MessageProperty::Ordered,
            MessagePropertyValue::Uint64(1),
        );
        assert!(result.is_err());
        assert!(props.ordered());
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let mut original = TransportProperties::build();
        original.set_selection_preference(SelectionProperty::Reliability, Preference::Require);

        let copy = original.clone();
        original.set_selection_preference(SelectionProperty::Reliability, Preference::Prohibit);
        original.set_connection_state(ConnectionState::Closed);

        assert_eq!(
            copy.selection().preference(SelectionProperty::Reliability),
            Preference::Require
        );
        assert_eq!(copy.connection_state(), ConnectionState::Establishing);
    }

    #[test]
    fn connection_properties_defaults() {
        let props = ConnectionProperties::build();
        assert_eq!(props.state(), ConnectionState::Establishing);
        assert_eq!(
            props.value(ConnectionProperty::ConnPriority),
            ConnectionPropertyValue::Integer(100)
        );
        assert_eq!(
            props.value(ConnectionProperty::ConnTimeout),
            ConnectionPropertyValue::Uint64(defaults::TIMEOUT_DISABLED)
        );
    }
}
