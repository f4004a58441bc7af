use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_newtype!(SlotId);
string_newtype!(ImageRef);

pub const QUICK_SLOT: &str = "quick";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Quick,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolId {
    Quick,
    FreeDrawing,
    HouseTreePerson,
    FamilyDrawing,
    Observation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub id: &'static str,
    pub label: &'static str,
    pub required: bool,
}

const QUICK_SLOTS: &[SlotSpec] = &[SlotSpec {
    id: QUICK_SLOT,
    label: "Drawing",
    required: true,
}];

const FREE_DRAWING_SLOTS: &[SlotSpec] = &[SlotSpec {
    id: "drawing",
    label: "Free drawing",
    required: true,
}];

const HOUSE_TREE_PERSON_SLOTS: &[SlotSpec] = &[
    SlotSpec {
        id: "house",
        label: "House",
        required: true,
    },
    SlotSpec {
        id: "tree",
        label: "Tree",
        required: true,
    },
    SlotSpec {
        id: "person",
        label: "Person",
        required: true,
    },
];

const FAMILY_DRAWING_SLOTS: &[SlotSpec] = &[
    SlotSpec {
        id: "family",
        label: "Family drawing",
        required: true,
    },
    SlotSpec {
        id: "self_portrait",
        label: "Self portrait",
        required: false,
    },
];

const OBSERVATION_SLOTS: &[SlotSpec] = &[SlotSpec {
    id: "sample",
    label: "Work sample",
    required: false,
}];

impl ProtocolId {
    pub const ALL: [ProtocolId; 5] = [
        ProtocolId::Quick,
        ProtocolId::FreeDrawing,
        ProtocolId::HouseTreePerson,
        ProtocolId::FamilyDrawing,
        ProtocolId::Observation,
    ];

    /// Protocol selected when switching into Advanced mode.
    pub const ADVANCED_DEFAULT: ProtocolId = ProtocolId::FreeDrawing;

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolId::Quick => "quick",
            ProtocolId::FreeDrawing => "free_drawing",
            ProtocolId::HouseTreePerson => "house_tree_person",
            ProtocolId::FamilyDrawing => "family_drawing",
            ProtocolId::Observation => "observation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|protocol| protocol.as_str() == raw.trim())
    }

    pub fn mode(self) -> Mode {
        match self {
            ProtocolId::Quick => Mode::Quick,
            _ => Mode::Advanced,
        }
    }

    pub fn slots(self) -> &'static [SlotSpec] {
        match self {
            ProtocolId::Quick => QUICK_SLOTS,
            ProtocolId::FreeDrawing => FREE_DRAWING_SLOTS,
            ProtocolId::HouseTreePerson => HOUSE_TREE_PERSON_SLOTS,
            ProtocolId::FamilyDrawing => FAMILY_DRAWING_SLOTS,
            ProtocolId::Observation => OBSERVATION_SLOTS,
        }
    }

    pub fn declares(self, slot: &SlotId) -> bool {
        self.slots().iter().any(|spec| spec.id == slot.as_str())
    }

    pub fn required_slots(self) -> impl Iterator<Item = &'static SlotSpec> {
        self.slots().iter().filter(|spec| spec.required)
    }

    /// Human readable label for a slot, falling back to the slot id.
    pub fn slot_label(self, slot: &SlotId) -> String {
        self.slots()
            .iter()
            .find(|spec| spec.id == slot.as_str())
            .map(|spec| spec.label.to_string())
            .unwrap_or_else(|| slot.0.clone())
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChildProfile {
    pub name: Option<String>,
    pub age: Option<u32>,
}
