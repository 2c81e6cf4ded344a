use anyhow::Context;
use parking_lot::Mutex;
use pcap_file::pcapng::PcapNgWriter;
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::blocks::section_header::SectionHeaderBlock;
use pcap_file::{DataLink, Endianness};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::frame::Frame;

type BoxedWriter = Box<dyn Write + Send + Sync + 'static>;

/// Records every frame leaving the tunnel in one direction as a pcapng capture
pub struct PcapExporter {
    capture_start: Instant,
    total_tracked_frames: AtomicU64,
    writer: Mutex<PcapNgWriter<BufWriter<BoxedWriter>>>,
}

impl PcapExporter {
    pub fn new(writer: impl Write + Send + Sync + 'static) -> anyhow::Result<Self> {
        let writer: BoxedWriter = Box::new(writer);
        let mut writer = PcapNgWriter::with_section_header(
            BufWriter::new(writer),
            SectionHeaderBlock {
                endianness: Endianness::Big,
                major_version: 1,
                minor_version: 0,
                section_length: 0,
                options: vec![],
            },
        )
        .context("failed to write pcapng section header")?;

        writer
            .write_pcapng_block(InterfaceDescriptionBlock {
                linktype: DataLink::ETHERNET,
                snaplen: 65535,
                options: vec![],
            })
            .context("failed to write pcapng interface description")?;

        Ok(Self {
            capture_start: Instant::now(),
            writer: Mutex::new(writer),
            total_tracked_frames: AtomicU64::new(0),
        })
    }

    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;
        Self::new(file)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.writer
            .lock()
            .get_mut()
            .flush()
            .context("failed to flush pcap writer")
    }

    pub fn total_tracked_frames(&self) -> u64 {
        self.total_tracked_frames.load(Ordering::Relaxed)
    }

    pub fn track_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        self.total_tracked_frames.fetch_add(1, Ordering::Relaxed);

        let mut writer = self.writer.lock();
        writer
            .write_pcapng_block(EnhancedPacketBlock {
                interface_id: 0,
                timestamp: correct_timestamp(self.capture_start.elapsed()),
                original_len: frame.len() as u32,
                data: frame.as_bytes().into(),
                options: Vec::new(),
            })
            .context("failed to write pcapng packet block")?;

        Ok(())
    }
}

fn correct_timestamp(d: Duration) -> Duration {
    // Round to the nearest millisecond
    let millis = (d.as_secs_f64() * 1000.0).round();

    // pcap-file scales the timestamp by another factor of 1000 when writing
    Duration::from_secs_f64(millis / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_frames;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<SyncMutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frames_are_written_after_the_headers() {
        let buffer = SharedBuffer::default();
        let exporter = PcapExporter::new(buffer.clone()).unwrap();
        exporter.flush().unwrap();
        let header_len = buffer.0.lock().len();
        assert!(header_len > 0);

        let frame = test_frames::numbered(7);
        exporter.track_frame(&frame).unwrap();
        exporter.flush().unwrap();

        let written = buffer.0.lock();
        assert_eq!(exporter.total_tracked_frames(), 1);
        assert!(written.len() > header_len + frame.len());
        assert!(
            written
                .windows(frame.len())
                .any(|window| window == frame.as_bytes())
        );
    }
}
