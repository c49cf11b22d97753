//! Capture loader
//!
//! Reads classic libpcap capture files into frames the datapath can replay.
//! Both microsecond and nanosecond timestamp variants are accepted, in
//! either byte order. Only Ethernet captures are supported.

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{info, warn};
use pcap_file::{pcap::PcapParser, DataLink, PcapError, TsResolution};
use std::path::Path;

/// One captured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Capture time (nanoseconds since the epoch)
    pub timestamp_ns: u64,
    /// Length of the packet on the wire
    pub wire_len: u32,
    /// Captured bytes, possibly shorter than `wire_len`
    pub data: Bytes,
}

/// Parsed capture file
#[derive(Debug)]
pub struct PcapLoader {
    snaplen: u32,
    frames: Vec<CapturedFrame>,
}

impl PcapLoader {
    /// Load a capture file from disk
    ///
    /// # Arguments
    ///
    /// * `path` - Path to a libpcap capture file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading capture from {:?}", path);
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read capture file: {:?}", path))?;
        let loader = Self::from_bytes(Bytes::from(data))
            .with_context(|| format!("Failed to parse capture file: {:?}", path))?;
        info!(
            "Loaded {} frames (snaplen {})",
            loader.frames.len(),
            loader.snaplen
        );
        Ok(loader)
    }

    /// Parse a capture held in memory
    ///
    /// Frame payloads share `data`'s allocation. A record cut short at the
    /// end of the capture ends the frame list. Records are read raw so that
    /// frames cut to the snap length still report their wire length.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        let (mut rest, parser) =
            PcapParser::new(&data).context("Failed to parse pcap global header")?;
        let header = parser.header();
        if header.datalink != DataLink::ETHERNET {
            anyhow::bail!(
                "unsupported link type {:?}, only Ethernet captures are supported",
                header.datalink
            );
        }

        let mut frames = Vec::new();
        while !rest.is_empty() {
            let offset = data.len() - rest.len();
            let (next, packet) = match parser.next_raw_packet(rest) {
                Ok(parsed) => parsed,
                Err(PcapError::IncompleteBuffer) => {
                    warn!("Ignoring truncated record at offset {}", offset);
                    break;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("Invalid record at offset {}", offset))
                }
            };

            let frac_ns = match header.ts_resolution {
                TsResolution::MicroSecond => u64::from(packet.ts_frac) * 1_000,
                TsResolution::NanoSecond => u64::from(packet.ts_frac),
            };
            frames.push(CapturedFrame {
                timestamp_ns: u64::from(packet.ts_sec) * 1_000_000_000 + frac_ns,
                wire_len: packet.orig_len.max(packet.incl_len),
                data: data.slice_ref(&packet.data),
            });
            rest = next;
        }

        Ok(Self {
            snaplen: header.snaplen,
            frames,
        })
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<CapturedFrame> {
        self.frames
    }
}


#[cfg(test)]
mod tests {
    use super::test_capture::*;
    use super::*;
    use std::io::Write;

    #[test]
    fn test_microsecond_little_endian() {
        let data = ethernet_pcap(&[(10, 500, &[1, 2, 3]), (11, 0, &[4, 5])]);
        let loader = PcapLoader::from_bytes(Bytes::from(data)).unwrap();

        let frames = loader.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp_ns, 10_000_500_000);
        assert_eq!(frames[0].wire_len, 3);
        assert_eq!(frames[0].data.as_ref(), &[1, 2, 3]);
        assert_eq!(frames[1].timestamp_ns, 11_000_000_000);
        assert_eq!(loader.snaplen(), 65535);
    }

    #[test]
    fn test_nanosecond_big_endian() {
        let data = pcap(PCAP_MAGIC_NANOS, true, LINKTYPE_ETHERNET, &[(1, 42, &[9; 4])]);
        let frames = PcapLoader::from_bytes(Bytes::from(data)).unwrap().into_frames();

        assert_eq!(frames[0].timestamp_ns, 1_000_000_042);
        assert_eq!(frames[0].data.len(), 4);
    }

    #[test]
    fn test_rejects_other_link_types() {
        let data = pcap(PCAP_MAGIC_MICROS, false, 113, &[]);
        let err = PcapLoader::from_bytes(Bytes::from(data)).unwrap_err();
        assert!(err.to_string().contains("unsupported link type"));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut data = ethernet_pcap(&[]);
        data[0] = 0;
        assert!(PcapLoader::from_bytes(Bytes::from(data)).is_err());
        assert!(PcapLoader::from_bytes(Bytes::from_static(&[0xd4, 0xc3])).is_err());
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let mut data = ethernet_pcap(&[(1, 0, &[1, 2, 3, 4])]);
        data.truncate(data.len() - 2);
        let frames = PcapLoader::from_bytes(Bytes::from(data)).unwrap().into_frames();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_frames_share_capture_buffer() {
        let data = Bytes::from(ethernet_pcap(&[(1, 0, &[1, 2]), (2, 0, &[3, 4, 5])]));
        let frames = PcapLoader::from_bytes(data.clone()).unwrap().into_frames();

        let range = data.as_ptr_range();
        for frame in &frames {
            assert!(range.contains(&frame.data.as_ptr()));
        }
        assert_eq!(frames[1].data.as_ref(), &[3, 4, 5]);
    }

    #[test]
    fn test_snapped_frame_keeps_wire_length() {
        let mut data = ethernet_pcap(&[(1, 0, &[1, 2, 3, 4])]);
        // orig_len of the first record
        data[24 + 12..24 + 16].copy_from_slice(&1500u32.to_le_bytes());
        let frames = PcapLoader::from_bytes(Bytes::from(data)).unwrap().into_frames();

        assert_eq!(frames[0].wire_len, 1500);
        assert_eq!(frames[0].data.len(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&ethernet_pcap(&[(1, 0, &[0xaa; 60])])).unwrap();

        let loader = PcapLoader::load(file.path()).unwrap();
        assert_eq!(loader.frames().len(), 1);
    }

    #[test]
    fn test_missing_file() {
        let err = PcapLoader::load(Path::new("/nonexistent/capture.pcap")).unwrap_err();
        assert!(err.to_string().contains("Failed to read capture file"));
    }
}
