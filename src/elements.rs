//! IANA information-element dictionary (subset).
//!
//! Maps `(enterprise_number, element_id)` to a name and abstract type, for
//! template logging and record dumps. `enterprise_number == 0` is the IANA
//! registry. The built-in table covers the elements this collector emits
//! itself plus the common flow 5-tuple/counter set; an external YAML list
//! can extend it at startup.

use serde::Deserialize;

use std::collections::HashMap;
use std::path::Path;

/// Abstract data type of an information element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementType {
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Signed8,
    Signed16,
    Signed32,
    Signed64,
    Float32,
    Float64,
    Boolean,
    MacAddress,
    String,
    OctetArray,
    DateTimeSeconds,
    DateTimeMilliseconds,
    DateTimeMicroseconds,
    DateTimeNanoseconds,
    Ipv4Address,
    Ipv6Address,
    BasicList,
    SubTemplateList,
    SubTemplateMultiList,
}

/// One dictionary entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementDef {
    #[serde(default)]
    pub enterprise_number: u32,
    pub element_id: u16,
    pub name: String,
    pub data_type: ElementType,
}

use ElementType as ET;

static IANA_ELEMENTS: &[(u16, &str, ElementType)] = &[
    (1, "octetDeltaCount", ET::Unsigned64),
    (2, "packetDeltaCount", ET::Unsigned64),
    (4, "protocolIdentifier", ET::Unsigned8),
    (5, "ipClassOfService", ET::Unsigned8),
    (6, "tcpControlBits", ET::Unsigned16),
    (7, "sourceTransportPort", ET::Unsigned16),
    (8, "sourceIPv4Address", ET::Ipv4Address),
    (9, "sourceIPv4PrefixLength", ET::Unsigned8),
    (10, "ingressInterface", ET::Unsigned32),
    (11, "destinationTransportPort", ET::Unsigned16),
    (12, "destinationIPv4Address", ET::Ipv4Address),
    (13, "destinationIPv4PrefixLength", ET::Unsigned8),
    (14, "egressInterface", ET::Unsigned32),
    (15, "ipNextHopIPv4Address", ET::Ipv4Address),
    (16, "bgpSourceAsNumber", ET::Unsigned32),
    (17, "bgpDestinationAsNumber", ET::Unsigned32),
    (21, "flowEndSysUpTime", ET::Unsigned32),
    (22, "flowStartSysUpTime", ET::Unsigned32),
    (27, "sourceIPv6Address", ET::Ipv6Address),
    (28, "destinationIPv6Address", ET::Ipv6Address),
    (31, "flowLabelIPv6", ET::Unsigned32),
    (32, "icmpTypeCodeIPv4", ET::Unsigned16),
    (48, "samplerId", ET::Unsigned8),
    (56, "sourceMacAddress", ET::MacAddress),
    (80, "destinationMacAddress", ET::MacAddress),
    (89, "forwardingStatus", ET::Unsigned8),
    (96, "applicationName", ET::String),
    (136, "flowEndReason", ET::Unsigned8),
    (148, "flowId", ET::Unsigned64),
    (150, "flowStartSeconds", ET::DateTimeSeconds),
    (151, "flowEndSeconds", ET::DateTimeSeconds),
    (152, "flowStartMilliseconds", ET::DateTimeMilliseconds),
    (153, "flowEndMilliseconds", ET::DateTimeMilliseconds),
    (154, "flowStartMicroseconds", ET::DateTimeMicroseconds),
    (155, "flowEndMicroseconds", ET::DateTimeMicroseconds),
    (210, "paddingOctets", ET::OctetArray),
    (224, "ipTotalLength", ET::Unsigned64),
    (225, "postNATSourceIPv4Address", ET::Ipv4Address),
    (226, "postNATDestinationIPv4Address", ET::Ipv4Address),
    (346, "privateEnterpriseNumber", ET::Unsigned32),
];

/// Element dictionary with the IANA subset preloaded.
#[derive(Debug)]
pub struct ElementDictionary {
    entries: HashMap<(u32, u16), ElementDef>,
}

impl Default for ElementDictionary {
    fn default() -> Self {
        let mut entries = HashMap::new();
        for &(id, name, data_type) in IANA_ELEMENTS {
            entries.insert(
                (0, id),
                ElementDef {
                    enterprise_number: 0,
                    element_id: id,
                    name: name.to_string(),
                    data_type,
                },
            );
        }
        ElementDictionary { entries }
    }
}

impl ElementDictionary {
    pub fn new() -> Self {
        ElementDictionary::default()
    }

    /// Merge additional definitions from a YAML list of [`ElementDef`]s.
    pub fn load_extra(&mut self, path: &Path) -> Result<usize, crate::CollectorError> {
        let text = std::fs::read_to_string(path)?;
        let defs: Vec<ElementDef> = serde_yaml::from_str(&text)
            .map_err(|e| crate::CollectorError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let count = defs.len();
        for def in defs {
            self.entries
                .insert((def.enterprise_number, def.element_id), def);
        }
        Ok(count)
    }

    pub fn get(&self, enterprise_number: u32, element_id: u16) -> Option<&ElementDef> {
        self.entries.get(&(enterprise_number, element_id))
    }

    /// Human-readable element name; falls back to `enXXidYY` notation.
    pub fn name(&self, enterprise_number: u32, element_id: u16) -> std::borrow::Cow<'_, str> {
        match self.get(enterprise_number, element_id) {
            Some(def) => std::borrow::Cow::Borrowed(&def.name),
            None if enterprise_number == 0 => std::borrow::Cow::Owned(format!("id{element_id}")),
            None => std::borrow::Cow::Owned(format!("en{enterprise_number}id{element_id}")),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iana_subset_resolves() {
        let dict = ElementDictionary::new();
        assert_eq!(dict.name(0, 8), "sourceIPv4Address");
        assert_eq!(dict.name(0, 153), "flowEndMilliseconds");
        assert_eq!(dict.name(0, 9999), "id9999");
        assert_eq!(dict.name(44, 1), "en44id1");
    }
}
