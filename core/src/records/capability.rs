//! Device capability record and its flag categories
//!
//! Wire layout (one TLV record per field):
//! - 0x80 PHY version range, 4 bytes `[min.major, min.minor, max.major, max.minor]`
//! - 0x81 MAC version range, same layout
//! - 0x82..0x91 one byte per category, flag categories packed as a bitmask

use super::RecordError;
use crate::tlv::{ProtocolVersion, TlvBuffer, TlvDecoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const PHY_VERSION_RANGE_TAG: u8 = 0x80;
pub const MAC_VERSION_RANGE_TAG: u8 = 0x81;
pub const DEVICE_ROLES_TAG: u8 = 0x82;
pub const RANGING_METHOD_TAG: u8 = 0x83;
pub const STS_CONFIG_TAG: u8 = 0x84;
pub const MULTI_NODE_MODE_TAG: u8 = 0x85;
pub const RANGING_TIME_STRUCT_TAG: u8 = 0x86;
pub const SCHEDULED_MODE_TAG: u8 = 0x87;
pub const HOPPING_MODE_TAG: u8 = 0x88;
pub const BLOCK_STRIDING_TAG: u8 = 0x89;
pub const UWB_INITIATION_TIME_TAG: u8 = 0x8A;
pub const CHANNELS_TAG: u8 = 0x8B;
pub const RFRAME_CONFIG_TAG: u8 = 0x8C;
pub const CC_CONSTRAINT_LENGTH_TAG: u8 = 0x8D;
pub const BPRF_PARAMETER_SETS_TAG: u8 = 0x8E;
pub const HPRF_PARAMETER_SETS_TAG: u8 = 0x8F;
pub const AOA_SUPPORT_TAG: u8 = 0x90;
pub const EXTENDED_MAC_ADDRESS_TAG: u8 = 0x91;

/// Upper bound on records in one capability buffer
pub const CAPABILITY_MAX_COUNT: usize = 18;

/// Version assumed when a range is not present
pub const DEFAULT_VERSION: ProtocolVersion = ProtocolVersion::new(1, 1);

/// One bit of a capability bitmask byte
pub trait CapabilityFlag: Copy + Ord + 'static {
    const ALL: &'static [Self];

    fn mask(self) -> u8;
}

macro_rules! capability_flags {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $mask:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl CapabilityFlag for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn mask(self) -> u8 {
                match self {
                    $(Self::$variant => $mask),+
                }
            }
        }
    };
}

capability_flags!(
    /// Ranging device role
    DeviceRole { Responder = 0x01, Initiator = 0x02 }
);

capability_flags!(
    /// Two-way ranging method
    RangingMethod { SsTwrDeferred = 0x02, DsTwrDeferred = 0x04 }
);

capability_flags!(
    /// Scrambled timestamp sequence mode
    StsConfig { Static = 0x01, Dynamic = 0x02, DynamicIndividualKey = 0x04 }
);

capability_flags!(
    MultiNodeMode { Unicast = 0x01, OneToMany = 0x02, ManyToMany = 0x04 }
);

capability_flags!(
    Channel {
        Ch5 = 0x01,
        Ch6 = 0x02,
        Ch8 = 0x04,
        Ch9 = 0x08,
        Ch10 = 0x10,
        Ch12 = 0x20,
        Ch13 = 0x40,
        Ch14 = 0x80,
    }
);

capability_flags!(
    RframeConfig { Sp0 = 0x01, Sp1 = 0x02, Sp3 = 0x08 }
);

capability_flags!(
    /// Convolutional code constraint length
    CcConstraintLength { K3 = 0x01, K7 = 0x02 }
);

capability_flags!(
    /// Angle-of-arrival support
    AoaSupport { Azimuth90 = 0x01, Azimuth180 = 0x02, Elevation = 0x04, Fom = 0x08 }
);

impl Channel {
    pub fn number(self) -> u8 {
        match self {
            Channel::Ch5 => 5,
            Channel::Ch6 => 6,
            Channel::Ch8 => 8,
            Channel::Ch9 => 9,
            Channel::Ch10 => 10,
            Channel::Ch12 => 12,
            Channel::Ch13 => 13,
            Channel::Ch14 => 14,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.number() == number)
    }
}

/// Set of flags from one category
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagSet<F: Ord>(BTreeSet<F>);

impl<F: CapabilityFlag> FlagSet<F> {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn of(flags: &[F]) -> Self {
        flags.iter().copied().collect()
    }

    /// Bits not assigned to any flag are ignored
    pub fn from_byte(raw: u8) -> Self {
        F::ALL.iter().copied().filter(|f| raw & f.mask() != 0).collect()
    }

    pub fn to_byte(&self) -> u8 {
        self.0.iter().fold(0u8, |acc, f| acc | f.mask())
    }

    pub fn insert(&mut self, flag: F) {
        self.0.insert(flag);
    }

    pub fn contains(&self, flag: F) -> bool {
        self.0.contains(&flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        self.0.iter().copied()
    }

    pub fn intersection(&self, other: &Self) -> Self {
        self.0.intersection(&other.0).copied().collect()
    }
}

impl<F: CapabilityFlag> Default for FlagSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: CapabilityFlag> FromIterator<F> for FlagSet<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Capabilities a device advertises to its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub min_phy_version: ProtocolVersion,
    pub max_phy_version: ProtocolVersion,
    pub min_mac_version: ProtocolVersion,
    pub max_mac_version: ProtocolVersion,
    pub device_roles: Option<FlagSet<DeviceRole>>,
    pub ranging_methods: Option<FlagSet<RangingMethod>>,
    pub sts_config: Option<FlagSet<StsConfig>>,
    pub multi_node_modes: Option<FlagSet<MultiNodeMode>>,
    pub ranging_time_struct: Option<u8>,
    pub scheduled_mode: Option<u8>,
    pub hopping_mode: Option<bool>,
    pub block_striding: Option<bool>,
    pub uwb_initiation_time: Option<bool>,
    pub channels: Option<FlagSet<Channel>>,
    pub rframe_config: Option<FlagSet<RframeConfig>>,
    pub cc_constraint_length: Option<FlagSet<CcConstraintLength>>,
    pub bprf_parameter_sets: Option<u8>,
    pub hprf_parameter_sets: Option<u8>,
    pub aoa_support: Option<FlagSet<AoaSupport>>,
    pub extended_mac_address: Option<bool>,
}

impl Default for DeviceCapability {
    fn default() -> Self {
        Self {
            min_phy_version: DEFAULT_VERSION,
            max_phy_version: DEFAULT_VERSION,
            min_mac_version: DEFAULT_VERSION,
            max_mac_version: DEFAULT_VERSION,
            device_roles: None,
            ranging_methods: None,
            sts_config: None,
            multi_node_modes: None,
            ranging_time_struct: None,
            scheduled_mode: None,
            hopping_mode: None,
            block_striding: None,
            uwb_initiation_time: None,
            channels: None,
            rframe_config: None,
            cc_constraint_length: None,
            bprf_parameter_sets: None,
            hprf_parameter_sets: None,
            aoa_support: None,
            extended_mac_address: None,
        }
    }
}

fn version_range_bytes(min: ProtocolVersion, max: ProtocolVersion) -> [u8; 4] {
    [min.major, min.minor, max.major, max.minor]
}

fn version_range(decoder: &TlvDecoder, tag: u8) -> Option<(ProtocolVersion, ProtocolVersion)> {
    match decoder.get_byte_array(tag).ok()? {
        [a, b, c, d] => Some((ProtocolVersion::new(*a, *b), ProtocolVersion::new(*c, *d))),
        _ => None,
    }
}

fn flags<F: CapabilityFlag>(decoder: &TlvDecoder, tag: u8) -> Result<Option<FlagSet<F>>, RecordError> {
    Ok(decoder.optional_byte(tag)?.map(FlagSet::from_byte))
}

fn boolean(decoder: &TlvDecoder, tag: u8) -> Result<Option<bool>, RecordError> {
    Ok(decoder.optional_byte(tag)?.map(|b| b == 1))
}

impl DeviceCapability {
    pub fn builder() -> DeviceCapabilityBuilder {
        DeviceCapabilityBuilder::default()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = TlvBuffer::builder()
            .put_raw(
                PHY_VERSION_RANGE_TAG,
                &version_range_bytes(self.min_phy_version, self.max_phy_version),
            )
            .put_raw(
                MAC_VERSION_RANGE_TAG,
                &version_range_bytes(self.min_mac_version, self.max_mac_version),
            );

        let bytes: [(u8, Option<u8>); 16] = [
            (DEVICE_ROLES_TAG, self.device_roles.as_ref().map(FlagSet::to_byte)),
            (RANGING_METHOD_TAG, self.ranging_methods.as_ref().map(FlagSet::to_byte)),
            (STS_CONFIG_TAG, self.sts_config.as_ref().map(FlagSet::to_byte)),
            (MULTI_NODE_MODE_TAG, self.multi_node_modes.as_ref().map(FlagSet::to_byte)),
            (RANGING_TIME_STRUCT_TAG, self.ranging_time_struct),
            (SCHEDULED_MODE_TAG, self.scheduled_mode),
            (HOPPING_MODE_TAG, self.hopping_mode.map(u8::from)),
            (BLOCK_STRIDING_TAG, self.block_striding.map(u8::from)),
            (UWB_INITIATION_TIME_TAG, self.uwb_initiation_time.map(u8::from)),
            (CHANNELS_TAG, self.channels.as_ref().map(FlagSet::to_byte)),
            (RFRAME_CONFIG_TAG, self.rframe_config.as_ref().map(FlagSet::to_byte)),
            (CC_CONSTRAINT_LENGTH_TAG, self.cc_constraint_length.as_ref().map(FlagSet::to_byte)),
            (BPRF_PARAMETER_SETS_TAG, self.bprf_parameter_sets),
            (HPRF_PARAMETER_SETS_TAG, self.hprf_parameter_sets),
            (AOA_SUPPORT_TAG, self.aoa_support.as_ref().map(FlagSet::to_byte)),
            (EXTENDED_MAC_ADDRESS_TAG, self.extended_mac_address.map(u8::from)),
        ];
        for (tag, value) in bytes {
            if let Some(value) = value {
                buf = buf.put_byte(tag, value);
            }
        }
        buf.build()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        let decoder = TlvDecoder::parse(data, CAPABILITY_MAX_COUNT)?;
        let mut cap = DeviceCapability::default();

        if let Some((min, max)) = version_range(&decoder, PHY_VERSION_RANGE_TAG) {
            cap.min_phy_version = min;
            cap.max_phy_version = max;
        }
        if let Some((min, max)) = version_range(&decoder, MAC_VERSION_RANGE_TAG) {
            cap.min_mac_version = min;
            cap.max_mac_version = max;
        }

        cap.device_roles = flags(&decoder, DEVICE_ROLES_TAG)?;
        cap.ranging_methods = flags(&decoder, RANGING_METHOD_TAG)?;
        cap.sts_config = flags(&decoder, STS_CONFIG_TAG)?;
        cap.multi_node_modes = flags(&decoder, MULTI_NODE_MODE_TAG)?;
        cap.ranging_time_struct = decoder.optional_byte(RANGING_TIME_STRUCT_TAG)?;
        cap.scheduled_mode = decoder.optional_byte(SCHEDULED_MODE_TAG)?;
        cap.hopping_mode = boolean(&decoder, HOPPING_MODE_TAG)?;
        cap.block_striding = boolean(&decoder, BLOCK_STRIDING_TAG)?;
        cap.uwb_initiation_time = boolean(&decoder, UWB_INITIATION_TIME_TAG)?;
        cap.channels = flags(&decoder, CHANNELS_TAG)?;
        cap.rframe_config = flags(&decoder, RFRAME_CONFIG_TAG)?;
        cap.cc_constraint_length = flags(&decoder, CC_CONSTRAINT_LENGTH_TAG)?;
        cap.bprf_parameter_sets = decoder.optional_byte(BPRF_PARAMETER_SETS_TAG)?;
        cap.hprf_parameter_sets = decoder.optional_byte(HPRF_PARAMETER_SETS_TAG)?;
        cap.aoa_support = flags(&decoder, AOA_SUPPORT_TAG)?;
        cap.extended_mac_address = boolean(&decoder, EXTENDED_MAC_ADDRESS_TAG)?;

        Ok(cap)
    }

    /// Whether a session between the two devices can be negotiated at all
    ///
    /// Version ranges must overlap, one side must be able to initiate while
    /// the other responds, and declared channel sets must intersect.
    pub fn is_compatible_with(&self, other: &DeviceCapability) -> bool {
        let phy_overlap =
            self.min_phy_version <= other.max_phy_version && other.min_phy_version <= self.max_phy_version;
        let mac_overlap =
            self.min_mac_version <= other.max_mac_version && other.min_mac_version <= self.max_mac_version;
        if !phy_overlap || !mac_overlap {
            return false;
        }

        if let (Some(ours), Some(theirs)) = (&self.device_roles, &other.device_roles) {
            let pairs = (ours.contains(DeviceRole::Initiator) && theirs.contains(DeviceRole::Responder))
                || (ours.contains(DeviceRole::Responder) && theirs.contains(DeviceRole::Initiator));
            if !pairs {
                return false;
            }
        }

        if let Some(common) = self.common_channels(other) {
            if common.is_empty() {
                return false;
            }
        }

        true
    }

    /// `None` when either side left channels unspecified
    pub fn common_channels(&self, other: &DeviceCapability) -> Option<FlagSet<Channel>> {
        match (&self.channels, &other.channels) {
            (Some(ours), Some(theirs)) => Some(ours.intersection(theirs)),
            _ => None,
        }
    }

    pub fn preferred_phy_version(&self, other_min: ProtocolVersion) -> ProtocolVersion {
        self.min_phy_version.max(other_min).min(self.max_phy_version)
    }

    pub fn preferred_mac_version(&self, other_min: ProtocolVersion) -> ProtocolVersion {
        self.min_mac_version.max(other_min).min(self.max_mac_version)
    }
}

/// Accumulates capability fields, then hands out an immutable record
#[derive(Debug, Default, Clone)]
pub struct DeviceCapabilityBuilder {
    cap: DeviceCapability,
}

impl DeviceCapabilityBuilder {
    pub fn phy_version_range(mut self, min: ProtocolVersion, max: ProtocolVersion) -> Self {
        self.cap.min_phy_version = min;
        self.cap.max_phy_version = max;
        self
    }

    pub fn mac_version_range(mut self, min: ProtocolVersion, max: ProtocolVersion) -> Self {
        self.cap.min_mac_version = min;
        self.cap.max_mac_version = max;
        self
    }

    pub fn device_role(mut self, role: DeviceRole) -> Self {
        self.cap.device_roles.get_or_insert_with(FlagSet::new).insert(role);
        self
    }

    pub fn ranging_method(mut self, method: RangingMethod) -> Self {
        self.cap.ranging_methods.get_or_insert_with(FlagSet::new).insert(method);
        self
    }

    pub fn sts_config(mut self, sts: StsConfig) -> Self {
        self.cap.sts_config.get_or_insert_with(FlagSet::new).insert(sts);
        self
    }

    pub fn multi_node_mode(mut self, mode: MultiNodeMode) -> Self {
        self.cap.multi_node_modes.get_or_insert_with(FlagSet::new).insert(mode);
        self
    }

    pub fn channel(mut self, channel: Channel) -> Self {
        self.cap.channels.get_or_insert_with(FlagSet::new).insert(channel);
        self
    }

    pub fn rframe_config(mut self, rframe: RframeConfig) -> Self {
        self.cap.rframe_config.get_or_insert_with(FlagSet::new).insert(rframe);
        self
    }

    pub fn cc_constraint_length(mut self, len: CcConstraintLength) -> Self {
        self.cap.cc_constraint_length.get_or_insert_with(FlagSet::new).insert(len);
        self
    }

    pub fn aoa_support(mut self, aoa: AoaSupport) -> Self {
        self.cap.aoa_support.get_or_insert_with(FlagSet::new).insert(aoa);
        self
    }

    pub fn ranging_time_struct(mut self, value: u8) -> Self {
        self.cap.ranging_time_struct = Some(value);
        self
    }

    pub fn scheduled_mode(mut self, value: u8) -> Self {
        self.cap.scheduled_mode = Some(value);
        self
    }

    pub fn hopping_mode(mut self, enabled: bool) -> Self {
        self.cap.hopping_mode = Some(enabled);
        self
    }

    pub fn block_striding(mut self, enabled: bool) -> Self {
        self.cap.block_striding = Some(enabled);
        self
    }

    pub fn uwb_initiation_time(mut self, enabled: bool) -> Self {
        self.cap.uwb_initiation_time = Some(enabled);
        self
    }

    pub fn bprf_parameter_sets(mut self, sets: u8) -> Self {
        self.cap.bprf_parameter_sets = Some(sets);
        self
    }

    pub fn hprf_parameter_sets(mut self, sets: u8) -> Self {
        self.cap.hprf_parameter_sets = Some(sets);
        self
    }

    pub fn extended_mac_address(mut self, supported: bool) -> Self {
        self.cap.extended_mac_address = Some(supported);
        self
    }

    pub fn build(self) -> DeviceCapability {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> DeviceCapability {
        DeviceCapability::builder()
            .phy_version_range(ProtocolVersion::new(1, 0), ProtocolVersion::new(2, 0))
            .device_role(DeviceRole::Initiator)
            .device_role(DeviceRole::Responder)
            .sts_config(StsConfig::Dynamic)
            .channel(Channel::Ch5)
            .channel(Channel::Ch9)
            .hopping_mode(false)
            .aoa_support(AoaSupport::Fom)
            .build()
    }

    #[test]
    fn test_flag_byte_is_or_of_set() {
        let set = FlagSet::of(&[Channel::Ch5, Channel::Ch9, Channel::Ch14]);
        assert_eq!(set.to_byte(), 0x01 | 0x08 | 0x80);
        assert_eq!(FlagSet::<Channel>::from_byte(0x89), set);
    }

    #[test]
    fn test_unknown_bits_ignored() {
        let set = FlagSet::<RframeConfig>::from_byte(0xFF);
        assert_eq!(set, FlagSet::of(&[RframeConfig::Sp0, RframeConfig::Sp1, RframeConfig::Sp3]));
    }

    #[test]
    fn test_encoding_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[..6], &[0x80, 4, 1, 0, 2, 0]);
        assert_eq!(&bytes[6..12], &[0x81, 4, 1, 1, 1, 1]);
        let decoder = TlvDecoder::parse(&bytes, CAPABILITY_MAX_COUNT).unwrap();
        assert_eq!(decoder.get_byte(DEVICE_ROLES_TAG).unwrap(), 0x03);
        assert_eq!(decoder.get_byte(CHANNELS_TAG).unwrap(), 0x09);
        assert_eq!(decoder.get_byte(HOPPING_MODE_TAG).unwrap(), 0);
        assert!(!decoder.is_present(RANGING_METHOD_TAG));
    }

    #[test]
    fn test_round_trip_keeps_unset_fields_unset() {
        let cap = sample();
        let decoded = DeviceCapability::from_bytes(&cap.to_bytes()).unwrap();
        assert_eq!(decoded, cap);
        assert_eq!(decoded.ranging_methods, None);
        assert_eq!(decoded.hopping_mode, Some(false));
    }

    #[test]
    fn test_missing_ranges_default_to_1_1() {
        let cap = DeviceCapability::from_bytes(&[DEVICE_ROLES_TAG, 1, 0x01]).unwrap();
        assert_eq!(cap.min_phy_version, DEFAULT_VERSION);
        assert_eq!(cap.max_mac_version, DEFAULT_VERSION);
        assert_eq!(cap.device_roles, Some(FlagSet::of(&[DeviceRole::Responder])));
    }

    #[test]
    fn test_compatibility() {
        let initiator = DeviceCapability::builder()
            .device_role(DeviceRole::Initiator)
            .channel(Channel::Ch9)
            .build();
        let responder = DeviceCapability::builder()
            .device_role(DeviceRole::Responder)
            .channel(Channel::Ch9)
            .channel(Channel::Ch5)
            .build();
        assert!(initiator.is_compatible_with(&responder));
        assert!(!initiator.is_compatible_with(&initiator));

        let other_channel = DeviceCapability::builder()
            .device_role(DeviceRole::Responder)
            .channel(Channel::Ch5)
            .build();
        assert!(!initiator.is_compatible_with(&other_channel));

        let newer = DeviceCapability::builder()
            .phy_version_range(ProtocolVersion::new(2, 0), ProtocolVersion::new(3, 0))
            .build();
        assert!(!DeviceCapability::default().is_compatible_with(&newer));
    }

    #[test]
    fn test_preferred_versions() {
        let cap = sample();
        assert_eq!(cap.preferred_phy_version(ProtocolVersion::new(1, 1)), ProtocolVersion::new(1, 1));
        assert_eq!(cap.preferred_phy_version(ProtocolVersion::new(3, 0)), ProtocolVersion::new(2, 0));
        assert_eq!(cap.preferred_phy_version(ProtocolVersion::new(0, 9)), ProtocolVersion::new(1, 0));
    }

    #[test]
    fn test_too_many_records_rejected() {
        let mut bytes = Vec::new();
        for tag in 0x70..0x70 + 19u8 {
            bytes.extend_from_slice(&[tag, 0]);
        }
        assert!(DeviceCapability::from_bytes(&bytes).is_err());
    }

    fn flag_set<F: CapabilityFlag + std::fmt::Debug>() -> impl Strategy<Value = Option<FlagSet<F>>> {
        proptest::option::of(any::<u8>().prop_map(FlagSet::from_byte))
    }

    fn version() -> impl Strategy<Value = ProtocolVersion> {
        (any::<u8>(), any::<u8>()).prop_map(|(a, b)| ProtocolVersion::new(a, b))
    }

    prop_compose! {
        fn arb_capability()(
            versions in (version(), version(), version(), version()),
            device_roles in flag_set::<DeviceRole>(),
            ranging_methods in flag_set::<RangingMethod>(),
            sts_config in flag_set::<StsConfig>(),
            multi_node_modes in flag_set::<MultiNodeMode>(),
            scalars in (proptest::option::of(any::<u8>()), proptest::option::of(any::<u8>()),
                        proptest::option::of(any::<u8>()), proptest::option::of(any::<u8>())),
            bools in (proptest::option::of(any::<bool>()), proptest::option::of(any::<bool>()),
                      proptest::option::of(any::<bool>()), proptest::option::of(any::<bool>())),
            channels in flag_set::<Channel>(),
            rframe_config in flag_set::<RframeConfig>(),
            cc_constraint_length in flag_set::<CcConstraintLength>(),
            aoa_support in flag_set::<AoaSupport>(),
        ) -> DeviceCapability {
            DeviceCapability {
                min_phy_version: versions.0,
                max_phy_version: versions.1,
                min_mac_version: versions.2,
                max_mac_version: versions.3,
                device_roles,
                ranging_methods,
                sts_config,
                multi_node_modes,
                ranging_time_struct: scalars.0,
                scheduled_mode: scalars.1,
                hopping_mode: bools.0,
                block_striding: bools.1,
                uwb_initiation_time: bools.2,
                channels,
                rframe_config,
                cc_constraint_length,
                bprf_parameter_sets: scalars.2,
                hprf_parameter_sets: scalars.3,
                aoa_support,
                extended_mac_address: bools.3,
            }
        }
    }

    proptest! {
        #[test]
        fn prop_capability_round_trip(cap in arb_capability()) {
            let decoded = DeviceCapability::from_bytes(&cap.to_bytes()).unwrap();
            prop_assert_eq!(decoded, cap);
        }
    }
}
