//! Decoding of the binary `BX` reply.
//!
//! The reply is not self-describing: which blocks appear in each handle
//! record depends on the [ReplyOptions] sent with the request, and on the
//! handle's status byte. The layout, all little endian, is:
//!
//! ```text
//! header   u16 start sequence (A5C4), u16 reply length, u16 header CRC
//! count    u8 number of handle records
//! record   u8 handle ID, u8 status
//!          -- nothing more if the status is DISABLED (04) --
//!          TRANSFORMATION_DATA:
//!              if VALID or REPORT_ALL_TRANS: 4 x f32 quaternion (w,x,y,z),
//!                                            3 x f32 translation, f32 error
//!              always: u32 port status, u32 frame number
//!          TOOL_AND_MARKER:
//!              u8 fit quality bits, 10 bytes marker information
//!          SINGLE_ACT_STRAY_MARKER_POS:
//!              u8 marker status
//!              if VALID or REPORT_ALL_TRANS: 3 x f32 position
//!          TOOL_MARKERS_POS:
//!              u8 marker count N, ceil(N / 8) bytes out of volume bits,
//!              3 x f32 position
//! strays   PAS_STRAY_MARKERS_POS only:
//!              u8 marker count M, and if M > 0: ceil(M / 8) bytes out of
//!              volume bits, M x (3 x f32) positions
//! trailer  u16 system status, u16 CRC
//! ```
//!
//! Neither CRC is verified. The decoder fills a [BxFrame] first and the
//! driver commits it to the handle table only once the whole frame has been
//! read, so a failed read never leaves half a poll in the table.

use crate::error::Result;
use crate::port_handle::{ExtendedStatus, PortHandleTable, SensorStatus, ShortStatus};
use crate::reply_options::ReplyOptions;
use crate::transport::Transport;

use log::{debug, trace, warn};

/// Start sequence of a binary reply.
pub const BX_START_SEQUENCE: u16 = 0xA5C4;

/// Bytes of per-marker information in a `TOOL_AND_MARKER` block.
pub const MARKER_INFO_LEN: usize = 10;

/// The fixed six byte frame header. Captured, not checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BxHeader {
    /// Normally [BX_START_SEQUENCE].
    pub start_sequence: u16,
    /// Reply length in bytes as the device reports it.
    pub reply_length: u16,
    /// Header CRC as sent.
    pub header_crc: u16,
}

/// The fixed four byte frame trailer. Captured, not checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BxTrailer {
    /// System status bits.
    pub system_status: u16,
    /// Reply CRC as sent.
    pub crc: u16,
}

/// Pose data from a `TRANSFORMATION_DATA` block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transformation {
    /// Quaternion w, x, y, z.
    pub rot: [f32; 4],
    /// Translation x, y, z.
    pub trans: [f32; 3],
    /// RMS fit error.
    pub error: f32,
}

/// A `TOOL_AND_MARKER` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolMarkerInfo {
    /// Eight fit quality flags, one per bit.
    pub fit_bits: u8,
    /// Per-marker information, not interpreted further.
    pub marker_info: [u8; MARKER_INFO_LEN],
}

impl ToolMarkerInfo {
    /// Flag `bit` (0 to 7) of the fit quality byte.
    pub fn fit_flag(&self, bit: u8) -> bool {
        bit < 8 && self.fit_bits & (1 << bit) != 0
    }
}

/// Status bits of a single stray active marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrayMarkerStatus {
    /// Bit 0.
    pub valid: bool,
    /// Bit 1.
    pub missing: bool,
    /// Bit 2.
    pub out_of_volume: bool,
}

impl StrayMarkerStatus {
    fn from_bits(bits: u8) -> Self {
        StrayMarkerStatus {
            valid: bits & 0b001 != 0,
            missing: bits & 0b010 != 0,
            out_of_volume: bits & 0b100 != 0,
        }
    }
}

/// A `SINGLE_ACT_STRAY_MARKER_POS` block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleStrayMarker {
    /// Marker status.
    pub status: StrayMarkerStatus,
    /// Position, present when the pose gate let it through.
    pub position: Option<[f32; 3]>,
}

/// A `TOOL_MARKERS_POS` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolMarkers {
    /// Number of markers on the tool.
    pub count: u8,
    /// Out of volume bits, one per marker, least significant bit first.
    pub out_of_volume: Vec<u8>,
    /// Marker position.
    pub position: [f32; 3],
}

/// Everything one handle record carried.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleRecord {
    /// Two hex digit handle ID.
    pub id: String,
    /// Status byte.
    pub sensor_status: SensorStatus,
    /// The same byte read as short status flags.
    pub short_status: ShortStatus,
    /// Pose, when requested and gated through.
    pub transformation: Option<Transformation>,
    /// Port status and frame number, whenever `TRANSFORMATION_DATA` was
    /// requested and the handle is not disabled.
    pub port_status: Option<(ExtendedStatus, u32)>,
    /// Tool fit quality block.
    pub tool_info: Option<ToolMarkerInfo>,
    /// Single stray active marker block.
    pub single_stray: Option<SingleStrayMarker>,
    /// Tool markers block.
    pub tool_markers: Option<ToolMarkers>,
}

impl HandleRecord {
    fn new(id: String, status: u8) -> Self {
        HandleRecord {
            id,
            sensor_status: SensorStatus::from_code(status),
            short_status: ShortStatus::from_bits(status as u32),
            transformation: None,
            port_status: None,
            tool_info: None,
            single_stray: None,
            tool_markers: None,
        }
    }

    /// The translation this record leaves on its handle. Later blocks win
    /// over earlier ones.
    pub fn translation(&self) -> Option<[f32; 3]> {
        self.tool_markers
            .as_ref()
            .map(|m| m.position)
            .or_else(|| self.single_stray.and_then(|s| s.position))
            .or_else(|| self.transformation.map(|t| t.trans))
    }
}

/// One fully decoded `BX` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct BxFrame {
    /// Frame header.
    pub header: BxHeader,
    /// Handle records in the order the device sent them.
    pub records: Vec<HandleRecord>,
    /// Passive stray marker positions, empty unless requested and seen.
    pub stray_markers: Vec<[f32; 3]>,
    /// Out of volume bits for the passive stray markers.
    pub stray_out_of_volume: Vec<u8>,
    /// Frame trailer.
    pub trailer: BxTrailer,
}

impl BxFrame {
    /// The record for handle `id`, if the frame carried one.
    pub fn record(&self, id: &str) -> Option<&HandleRecord> {
        self.records.iter().find(|r| r.id.eq_ignore_ascii_case(id))
    }

    /// Write every record onto its port handle. Records for handles the table
    /// does not know are logged and skipped; their IDs are returned.
    pub fn apply_to(&self, table: &mut PortHandleTable) -> Vec<String> {
        let mut unknown = Vec::new();
        for record in &self.records {
            let Some(handle) = table.get_mut(&record.id) else {
                warn!("BX reported unknown port handle {}, dropping it", record.id);
                unknown.push(record.id.clone());
                continue;
            };

            handle.sensor_status = record.sensor_status;
            handle.apply_short_status(&record.short_status);
            if let Some(t) = record.transformation {
                handle.rot = t.rot;
                handle.trans = t.trans;
                handle.error = t.error;
            }
            if let Some(trans) = record.translation() {
                handle.trans = trans;
            }
            if let Some((status, frame_number)) = record.port_status {
                handle.apply_extended_status(&status);
                handle.frame_number = frame_number;
            }
        }
        unknown
    }
}

/// Pulls fixed width little endian fields off a transport.
struct FieldReader<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Transport + ?Sized> FieldReader<'a, T> {
    fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.transport.read_exact(n)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32s<const N: usize>(&mut self) -> Result<[f32; N]> {
        let b = self.bytes(4 * N)?;
        let mut out = [0.0; N];
        for (value, chunk) in out.iter_mut().zip(b.chunks_exact(4)) {
            *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(out)
    }
}

/// Bytes needed for one bit per marker.
fn bitmap_len(markers: u8) -> usize {
    (markers as usize).div_ceil(8)
}

/// Decodes `BX` replies laid out for one set of [ReplyOptions].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryReplyDecoder {
    options: ReplyOptions,
}

impl BinaryReplyDecoder {
    /// A decoder for replies to a `BX` sent with `options`.
    pub fn new(options: ReplyOptions) -> Result<Self> {
        Ok(BinaryReplyDecoder {
            options: options.validated()?,
        })
    }

    /// The options this decoder expects the reply to have been built with.
    pub fn options(&self) -> ReplyOptions {
        self.options
    }

    /// Read one whole frame. Consumes exactly the bytes the options and the
    /// per-record statuses imply; a short read is a transport error.
    pub fn decode<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<BxFrame> {
        let mut r = FieldReader { transport };

        let header = BxHeader {
            start_sequence: r.u16()?,
            reply_length: r.u16()?,
            header_crc: r.u16()?,
        };
        trace!("BX header {:04X?}", header);

        let n_records = r.u8()?;
        let records = (0..n_records)
            .map(|_| self.decode_record(&mut r))
            .collect::<Result<Vec<_>>>()?;

        let (stray_markers, stray_out_of_volume) =
            if self.options.contains(ReplyOptions::PAS_STRAY_MARKERS_POS) {
                self.decode_passive_strays(&mut r)?
            } else {
                (Vec::new(), Vec::new())
            };

        let trailer = BxTrailer {
            system_status: r.u16()?,
            crc: r.u16()?,
        };

        Ok(BxFrame {
            header,
            records,
            stray_markers,
            stray_out_of_volume,
            trailer,
        })
    }

    fn decode_record<T: Transport + ?Sized>(&self, r: &mut FieldReader<T>) -> Result<HandleRecord> {
        let id = format!("{:02X}", r.u8()?);
        let mut record = HandleRecord::new(id, r.u8()?);
        let sensor_status = record.sensor_status;

        if sensor_status == SensorStatus::Disabled {
            debug!("BX handle {} disabled", record.id);
            return Ok(record);
        }

        let pose_gate = self.options.reports_pose(sensor_status == SensorStatus::Valid);

        if self.options.contains(ReplyOptions::TRANSFORMATION_DATA) {
            if pose_gate {
                let rot = r.f32s::<4>()?;
                let trans = r.f32s::<3>()?;
                let error = r.f32s::<1>()?[0];
                record.transformation = Some(Transformation { rot, trans, error });
            }
            let status = ExtendedStatus::from_bits(r.u32()?);
            let frame_number = r.u32()?;
            record.port_status = Some((status, frame_number));
        }

        if self.options.contains(ReplyOptions::TOOL_AND_MARKER) {
            let fit_bits = r.u8()?;
            let mut marker_info = [0; MARKER_INFO_LEN];
            marker_info.copy_from_slice(&r.bytes(MARKER_INFO_LEN)?);
            record.tool_info = Some(ToolMarkerInfo {
                fit_bits,
                marker_info,
            });
        }

        if self.options.contains(ReplyOptions::SINGLE_ACT_STRAY_MARKER_POS) {
            let status = StrayMarkerStatus::from_bits(r.u8()?);
            trace!("BX handle {} stray marker {:?}", record.id, status);
            let position = if pose_gate {
                Some(r.f32s::<3>()?)
            } else {
                None
            };
            record.single_stray = Some(SingleStrayMarker { status, position });
        }

        if self.options.contains(ReplyOptions::TOOL_MARKERS_POS) {
            let count = r.u8()?;
            let out_of_volume = r.bytes(bitmap_len(count))?;
            let position = r.f32s::<3>()?;
            record.tool_markers = Some(ToolMarkers {
                count,
                out_of_volume,
                position,
            });
        }

        debug!("BX record {:?}", record);
        Ok(record)
    }

    fn decode_passive_strays<T: Transport + ?Sized>(
        &self,
        r: &mut FieldReader<T>,
    ) -> Result<(Vec<[f32; 3]>, Vec<u8>)> {
        let count = r.u8()?;
        if count == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let out_of_volume = r.bytes(bitmap_len(count))?;
        let positions = (0..count)
            .map(|_| r.f32s::<3>())
            .collect::<Result<Vec<_>>>()?;
        debug!("BX {} passive stray markers", positions.len());
        Ok((positions, out_of_volume))
    }
}


#[cfg(test)]
mod tests {
    use super::frame_builder::FrameBuilder;
    use super::*;
    use crate::dummy_transport::DummyTransport;
    use crate::port_handle::PortHandle;

    const ROT: [f32; 4] = [1.0, 0.0, 0.0, 0.0];
    const TRANS: [f32; 3] = [10.5, -20.25, -1500.0];

    fn loaded(bytes: &[u8]) -> DummyTransport {
        let mut transport = DummyTransport::new();
        transport.open().unwrap();
        transport.queue_bytes(bytes);
        transport
    }

    fn decode(options: ReplyOptions, bytes: &[u8]) -> (BxFrame, DummyTransport) {
        let mut transport = loaded(bytes);
        let frame = BinaryReplyDecoder::new(options)
            .unwrap()
            .decode(&mut transport)
            .unwrap();
        (frame, transport)
    }

    #[test]
    fn valid_transformation_consumes_exact_length() {
        let bytes = FrameBuilder::new()
            .record(0x0A, 0x01)
            .floats(&ROT)
            .floats(&TRANS)
            .floats(&[0.125])
            .u32(0x31)
            .u32(4242)
            .build();
        assert_eq!(bytes.len(), 6 + 1 + (2 + 16 + 12 + 4 + 4 + 4) + 4);

        let (frame, transport) = decode(ReplyOptions::TRANSFORMATION_DATA, &bytes);
        assert_eq!(transport.remaining(), 0);
        assert_eq!(frame.header.start_sequence, BX_START_SEQUENCE);
        assert_eq!(frame.trailer.crc, 0xCAFE);

        let record = frame.record("0A").unwrap();
        assert_eq!(record.sensor_status, SensorStatus::Valid);
        assert_eq!(
            record.transformation,
            Some(Transformation {
                rot: ROT,
                trans: TRANS,
                error: 0.125
            })
        );
        let (status, frame_number) = record.port_status.unwrap();
        assert!(status.short.occupied && status.short.initialized && status.short.enabled);
        assert_eq!(frame_number, 4242);
    }

    #[test]
    fn disabled_handle_skips_every_block() {
        let options = ReplyOptions::TRANSFORMATION_DATA
            | ReplyOptions::TOOL_AND_MARKER
            | ReplyOptions::SINGLE_ACT_STRAY_MARKER_POS
            | ReplyOptions::TOOL_MARKERS_POS;
        let bytes = FrameBuilder::new().record(0x01, 0x04).build();
        assert_eq!(bytes.len(), 6 + 1 + 2 + 4);

        let (frame, transport) = decode(options, &bytes);
        assert_eq!(transport.remaining(), 0);
        let record = &frame.records[0];
        assert_eq!(record.sensor_status, SensorStatus::Disabled);
        assert_eq!(record.transformation, None);
        assert_eq!(record.port_status, None);
    }

    #[test]
    fn missing_handle_still_reads_port_status_and_frame() {
        let bytes = FrameBuilder::new()
            .record(0x0B, 0x02)
            .u32(0x1F1)
            .u32(77)
            .build();
        assert_eq!(bytes.len(), 6 + 1 + 2 + 4 + 4 + 4);

        let (frame, transport) = decode(ReplyOptions::TRANSFORMATION_DATA, &bytes);
        assert_eq!(transport.remaining(), 0);
        let record = &frame.records[0];
        assert_eq!(record.transformation, None);
        let (status, frame_number) = record.port_status.unwrap();
        assert!(status.out_of_volume && status.partial_out_of_volume && status.sensor_broken);
        assert_eq!(frame_number, 77);
    }

    #[test]
    fn report_all_reads_pose_of_missing_handle() {
        let options = ReplyOptions::TRANSFORMATION_DATA | ReplyOptions::REPORT_ALL_TRANS;
        let bytes = FrameBuilder::new()
            .record(0x0B, 0x02)
            .floats(&ROT)
            .floats(&TRANS)
            .floats(&[99.0])
            .u32(0x71)
            .u32(5)
            .build();

        let (frame, transport) = decode(options, &bytes);
        assert_eq!(transport.remaining(), 0);
        assert_eq!(frame.records[0].transformation.unwrap().error, 99.0);
    }

    #[test]
    fn later_blocks_overwrite_translation() {
        let options = ReplyOptions::TRANSFORMATION_DATA
            | ReplyOptions::TOOL_AND_MARKER
            | ReplyOptions::SINGLE_ACT_STRAY_MARKER_POS
            | ReplyOptions::TOOL_MARKERS_POS;
        let bytes = FrameBuilder::new()
            .record(0x0A, 0x01)
            .floats(&ROT)
            .floats(&TRANS)
            .floats(&[0.5])
            .u32(0x31)
            .u32(1)
            // fit bits and marker info
            .raw(&[0b1000_0001])
            .raw(&[0; MARKER_INFO_LEN])
            // single stray: valid
            .raw(&[0b001])
            .floats(&[1.0, 2.0, 3.0])
            // nine tool markers, two bitmap bytes
            .raw(&[9, 0xFF, 0x01])
            .floats(&[4.0, 5.0, 6.0])
            .build();
        assert_eq!(
            bytes.len(),
            6 + 1 + 2 + (32 + 8) + (1 + 10) + (1 + 12) + (1 + 2 + 12) + 4
        );

        let (frame, transport) = decode(options, &bytes);
        assert_eq!(transport.remaining(), 0);
        let record = &frame.records[0];
        let info = record.tool_info.unwrap();
        assert!(info.fit_flag(0) && info.fit_flag(7) && !info.fit_flag(1));
        assert!(record.single_stray.unwrap().status.valid);
        assert_eq!(record.tool_markers.as_ref().unwrap().count, 9);
        assert_eq!(record.tool_markers.as_ref().unwrap().out_of_volume, vec![0xFF, 0x01]);
        assert_eq!(record.translation(), Some([4.0, 5.0, 6.0]));
    }

    #[test]
    fn single_stray_position_is_gated() {
        let bytes = FrameBuilder::new().record(0x0C, 0x02).raw(&[0b010]).build();
        let (frame, transport) = decode(ReplyOptions::SINGLE_ACT_STRAY_MARKER_POS, &bytes);
        assert_eq!(transport.remaining(), 0);
        let stray = frame.records[0].single_stray.unwrap();
        assert!(stray.status.missing);
        assert_eq!(stray.position, None);
        assert_eq!(frame.records[0].translation(), None);
    }

    #[test]
    fn passive_strays_with_zero_markers() {
        let options = ReplyOptions::TRANSFORMATION_DATA | ReplyOptions::PAS_STRAY_MARKERS_POS;
        let bytes = FrameBuilder::new().tail(&[0]).build();
        assert_eq!(bytes.len(), 6 + 1 + 1 + 4);

        let (frame, transport) = decode(options, &bytes);
        assert_eq!(transport.remaining(), 0);
        assert!(frame.records.is_empty());
        assert!(frame.stray_markers.is_empty());
    }

    #[test]
    fn passive_strays_in_order() {
        let mut tail = vec![3, 0b100];
        for p in [[1.0f32, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]] {
            tail.extend(p.iter().flat_map(|f| f.to_le_bytes()));
        }
        let bytes = FrameBuilder::new().tail(&tail).build();

        let (frame, transport) = decode(ReplyOptions::PAS_STRAY_MARKERS_POS, &bytes);
        assert_eq!(transport.remaining(), 0);
        assert_eq!(
            frame.stray_markers,
            vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]]
        );
        assert_eq!(frame.stray_out_of_volume, vec![0b100]);
    }

    #[test]
    fn short_stream_is_a_transport_error() {
        let mut bytes = FrameBuilder::new()
            .record(0x0A, 0x01)
            .floats(&ROT)
            .floats(&TRANS)
            .floats(&[0.1])
            .u32(0x31)
            .u32(1)
            .build();
        bytes.truncate(bytes.len() - 3);
        let mut transport = loaded(&bytes);
        let decoder = BinaryReplyDecoder::new(ReplyOptions::TRANSFORMATION_DATA).unwrap();
        assert!(matches!(
            decoder.decode(&mut transport),
            Err(crate::error::NdiError::Transport(_))
        ));
    }

    #[test]
    fn apply_updates_known_and_skips_unknown() {
        let bytes = FrameBuilder::new()
            .record(0x0A, 0x01)
            .floats(&ROT)
            .floats(&TRANS)
            .floats(&[0.2])
            .u32(0x31)
            .u32(9)
            .record(0x0F, 0x02)
            .u32(0x01)
            .u32(9)
            .build();
        let (frame, _) = decode(ReplyOptions::TRANSFORMATION_DATA, &bytes);

        let mut table = PortHandleTable::new();
        table.insert(PortHandle::new("0A"));
        let unknown = frame.apply_to(&mut table);
        assert_eq!(unknown, vec!["0F".to_string()]);

        let handle = table.get("0A").unwrap();
        assert_eq!(handle.trans, TRANS);
        assert_eq!(handle.rot, ROT);
        assert_eq!(handle.error, 0.2);
        assert_eq!(handle.frame_number, 9);
        assert!(handle.enabled);
    }

    #[test]
    fn status_byte_refreshes_short_flags_without_transformation() {
        let mut table = PortHandleTable::new();
        table.insert(PortHandle::new("0A"));
        assert!(!table.get("0A").unwrap().occupied);

        let bytes = FrameBuilder::new().record(0x0A, 0x01).raw(&[0; 11]).build();
        let (frame, transport) = decode(ReplyOptions::TOOL_AND_MARKER, &bytes);
        assert_eq!(transport.remaining(), 0);
        frame.apply_to(&mut table);

        let handle = table.get("0A").unwrap();
        assert_eq!(handle.sensor_status, SensorStatus::Valid);
        assert!(handle.occupied);
        assert!(!handle.initialized && !handle.enabled);
    }

    #[test]
    fn missing_record_keeps_stale_pose() {
        let mut table = PortHandleTable::new();
        let mut handle = PortHandle::new("0A");
        handle.trans = TRANS;
        handle.error = 0.3;
        table.insert(handle);

        let bytes = FrameBuilder::new().record(0x0A, 0x02).u32(0x31).u32(10).build();
        let (frame, _) = decode(ReplyOptions::TRANSFORMATION_DATA, &bytes);
        frame.apply_to(&mut table);

        let handle = table.get("0A").unwrap();
        assert_eq!(handle.sensor_status, SensorStatus::Missing);
        assert_eq!(handle.trans, TRANS);
        assert_eq!(handle.error, 0.3);
        assert_eq!(handle.frame_number, 10);
    }
}
