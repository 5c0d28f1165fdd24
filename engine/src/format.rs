use crate::error::BridgeError;
use serde::Deserialize;

/// Format identifier of a stream description. Only linear PCM is translatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatId {
    LinearPcm,
    Other(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FormatFlags {
    pub float: bool,
    pub signed: bool,
    pub big_endian: bool,
    pub non_interleaved: bool,
}

/// Abstract description of one direction's sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SampleFormatDescriptor {
    pub format_id: FormatId,
    pub sample_rate: f64,
    pub bits_per_channel: u32,
    pub channels_per_frame: u32,
    #[serde(default)]
    pub flags: FormatFlags,
    pub bytes_per_frame: u32,
}

impl SampleFormatDescriptor {
    /// Linear PCM description with `bytes_per_frame` derived from the layout:
    /// a planar frame covers one channel, an interleaved frame covers all of them.
    pub fn linear_pcm(
        sample_rate: f64,
        bits_per_channel: u32,
        channels: u32,
        flags: FormatFlags,
    ) -> Self {
        let sample_bytes = bits_per_channel.div_ceil(8);
        let bytes_per_frame = if flags.non_interleaved {
            sample_bytes
        } else {
            sample_bytes * channels
        };
        Self {
            format_id: FormatId::LinearPcm,
            sample_rate,
            bits_per_channel,
            channels_per_frame: channels,
            flags,
            bytes_per_frame,
        }
    }

    pub fn s16le_interleaved(sample_rate: f64, channels: u32) -> Self {
        Self::linear_pcm(
            sample_rate,
            16,
            channels,
            FormatFlags {
                signed: true,
                ..FormatFlags::default()
            },
        )
    }

    pub fn is_planar(&self) -> bool {
        self.flags.non_interleaved
    }

    pub fn access(&self) -> AccessLayout {
        if self.is_planar() {
            AccessLayout::NonInterleaved
        } else {
            AccessLayout::Interleaved
        }
    }
}

impl Default for SampleFormatDescriptor {
    fn default() -> Self {
        Self::s16le_interleaved(48_000.0, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLayout {
    Interleaved,
    NonInterleaved,
}

/// Concrete sample formats a PCM device accepts. 24-bit samples are packed
/// into three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFormat {
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    S243Le,
    S243Be,
    U243Le,
    U243Be,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
    FloatLe,
    FloatBe,
}

impl DeviceFormat {
    /// Bytes one sample of this format occupies in a device buffer.
    pub fn sample_bytes(self) -> u32 {
        use DeviceFormat::*;
        match self {
            S8 | U8 => 1,
            S16Le | S16Be | U16Le | U16Be => 2,
            S243Le | S243Be | U243Le | U243Be => 3,
            S32Le | S32Be | U32Le | U32Be | FloatLe | FloatBe => 4,
        }
    }
}

/// Maps a stream description onto the device format table.
///
/// The float flag wins over the bit depth; integer formats are picked by
/// depth, signedness and byte order. 8-bit formats have no byte order.
pub fn translate(desc: &SampleFormatDescriptor) -> Result<DeviceFormat, BridgeError> {
    if desc.format_id != FormatId::LinearPcm {
        return Err(BridgeError::UnsupportedFormat(desc.format_id));
    }
    let FormatFlags {
        float,
        signed,
        big_endian: be,
        ..
    } = desc.flags;
    if float {
        return Ok(if be {
            DeviceFormat::FloatBe
        } else {
            DeviceFormat::FloatLe
        });
    }
    use DeviceFormat::*;
    let format = match (desc.bits_per_channel, signed, be) {
        (8, true, _) => S8,
        (8, false, _) => U8,
        (16, true, false) => S16Le,
        (16, true, true) => S16Be,
        (16, false, false) => U16Le,
        (16, false, true) => U16Be,
        (24, true, false) => S243Le,
        (24, true, true) => S243Be,
        (24, false, false) => U243Le,
        (24, false, true) => U243Be,
        (32, true, false) => S32Le,
        (32, true, true) => S32Be,
        (32, false, false) => U32Le,
        (32, false, true) => U32Be,
        (bits, _, _) => return Err(BridgeError::InvalidBitDepth(bits)),
    };
    Ok(format)
}

#[cfg(target_os = "linux")]
impl From<DeviceFormat> for alsa::pcm::Format {
    fn from(format: DeviceFormat) -> Self {
        use alsa::pcm::Format;
        match format {
            DeviceFormat::S8 => Format::S8,
            DeviceFormat::U8 => Format::U8,
            DeviceFormat::S16Le => Format::S16LE,
            DeviceFormat::S16Be => Format::S16BE,
            DeviceFormat::U16Le => Format::U16LE,
            DeviceFormat::U16Be => Format::U16BE,
            DeviceFormat::S243Le => Format::S243LE,
            DeviceFormat::S243Be => Format::S243BE,
            DeviceFormat::U243Le => Format::U243LE,
            DeviceFormat::U243Be => Format::U243BE,
            DeviceFormat::S32Le => Format::S32LE,
            DeviceFormat::S32Be => Format::S32BE,
            DeviceFormat::U32Le => Format::U32LE,
            DeviceFormat::U32Be => Format::U32BE,
            DeviceFormat::FloatLe => Format::FloatLE,
            DeviceFormat::FloatBe => Format::FloatBE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn desc(bits: u32, float: bool, signed: bool, big_endian: bool) -> SampleFormatDescriptor {
        SampleFormatDescriptor::linear_pcm(
            44_100.0,
            bits,
            2,
            FormatFlags {
                float,
                signed,
                big_endian,
                non_interleaved: false,
            },
        )
    }

    #[test]
    fn integer_formats_are_unique_per_combination() {
        let mut seen = HashSet::new();
        for bits in [16, 24, 32] {
            for signed in [false, true] {
                for be in [false, true] {
                    let format = translate(&desc(bits, false, signed, be)).unwrap();
                    assert!(seen.insert(format), "duplicate mapping {format:?}");
                }
            }
        }
        for signed in [false, true] {
            assert!(seen.insert(translate(&desc(8, false, signed, false)).unwrap()));
        }
        assert_eq!(seen.len(), 14);
    }

    #[test]
    fn translation_is_deterministic() {
        let d = desc(24, false, true, true);
        assert_eq!(translate(&d).unwrap(), translate(&d).unwrap());
        assert_eq!(translate(&d).unwrap(), DeviceFormat::S243Be);
    }

    #[test]
    fn eight_bit_ignores_endianness() {
        assert_eq!(translate(&desc(8, false, true, true)).unwrap(), DeviceFormat::S8);
        assert_eq!(translate(&desc(8, false, false, true)).unwrap(), DeviceFormat::U8);
    }

    #[test]
    fn float_flag_selects_float_by_endianness() {
        assert_eq!(translate(&desc(32, true, true, false)).unwrap(), DeviceFormat::FloatLe);
        assert_eq!(translate(&desc(32, true, true, true)).unwrap(), DeviceFormat::FloatBe);
    }

    #[test]
    fn rejects_odd_bit_depths() {
        for bits in [0, 4, 12, 20, 48, 64] {
            match translate(&desc(bits, false, true, false)) {
                Err(BridgeError::InvalidBitDepth(b)) => assert_eq!(b, bits),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_non_pcm() {
        let mut d = desc(16, false, true, false);
        d.format_id = FormatId::Other(0x61616320);
        assert!(matches!(translate(&d), Err(BridgeError::UnsupportedFormat(_))));
    }

    #[test]
    fn bytes_per_frame_follows_layout() {
        let interleaved = SampleFormatDescriptor::s16le_interleaved(48_000.0, 2);
        assert_eq!(interleaved.bytes_per_frame, 4);
        assert_eq!(interleaved.access(), AccessLayout::Interleaved);

        let planar = SampleFormatDescriptor::linear_pcm(
            48_000.0,
            24,
            6,
            FormatFlags {
                signed: true,
                non_interleaved: true,
                ..FormatFlags::default()
            },
        );
        assert_eq!(planar.bytes_per_frame, 3);
        assert_eq!(planar.access(), AccessLayout::NonInterleaved);
    }

    #[test]
    fn descriptor_sample_size_matches_device_width() {
        for bits in [8, 16, 24, 32] {
            for signed in [false, true] {
                for be in [false, true] {
                    let d = desc(bits, false, signed, be);
                    let format = translate(&d).unwrap();
                    assert_eq!(d.bytes_per_frame, format.sample_bytes() * 2, "{format:?}");
                }
            }
        }
        let float = desc(32, true, true, false);
        assert_eq!(float.bytes_per_frame, translate(&float).unwrap().sample_bytes() * 2);
    }

    #[test]
    fn twenty_four_bit_is_packed() {
        let d = desc(24, false, true, false);
        assert_eq!(translate(&d).unwrap(), DeviceFormat::S243Le);
        assert_eq!(d.bytes_per_frame, 6);
    }
}
