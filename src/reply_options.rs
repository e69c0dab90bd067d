//! The `BX` reply option mask. The same value builds the request and drives
//! the decoder, since the reply layout is only defined relative to what was
//! asked for.

use crate::error::{NdiError, Result};

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Blocks requested from a `BX` poll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReplyOptions: u16 {
        /// Quaternion, translation, fit error, port status and frame number.
        const TRANSFORMATION_DATA         = 0x0001;
        /// Tool fit quality bits and per-marker information.
        const TOOL_AND_MARKER             = 0x0002;
        /// Position of a single stray active marker.
        const SINGLE_ACT_STRAY_MARKER_POS = 0x0004;
        /// Positions of the markers on each tool.
        const TOOL_MARKERS_POS            = 0x0008;
        /// Report transformations even when they are out of volume.
        const REPORT_ALL_TRANS            = 0x0800;
        /// Positions of passive stray markers.
        const PAS_STRAY_MARKERS_POS       = 0x1000;
    }
}

impl Default for ReplyOptions {
    fn default() -> Self {
        ReplyOptions::TRANSFORMATION_DATA
    }
}

impl ReplyOptions {
    /// Build from a raw mask, refusing bits the decoder does not know how to
    /// lay out.
    pub fn from_mask(mask: u16) -> Result<Self> {
        let options = Self::from_bits(mask).ok_or_else(|| {
            NdiError::InvalidArgument(format!("unknown BX reply option bits in {:04X}", mask))
        })?;
        options.validated()
    }

    /// Check that the combination makes sense as a request: at least one
    /// data block, and `REPORT_ALL_TRANS` only alongside a block it gates.
    pub fn validated(self) -> Result<Self> {
        let data = self - Self::REPORT_ALL_TRANS;
        if data.is_empty() {
            return Err(NdiError::InvalidArgument(
                "BX needs at least one data block".to_owned(),
            ));
        }
        if self.contains(Self::REPORT_ALL_TRANS)
            && !self.intersects(Self::TRANSFORMATION_DATA | Self::SINGLE_ACT_STRAY_MARKER_POS)
        {
            return Err(NdiError::InvalidArgument(
                "REPORT_ALL_TRANS needs TRANSFORMATION_DATA or SINGLE_ACT_STRAY_MARKER_POS"
                    .to_owned(),
            ));
        }
        Ok(self)
    }

    /// The four hex digit argument for `BX`.
    pub fn to_arg(self) -> String {
        format!("{:04X}", self.bits())
    }

    /// Whether pose data is read for a handle with this validity.
    pub fn reports_pose(self, valid: bool) -> bool {
        valid || self.contains(Self::REPORT_ALL_TRANS)
    }
}
