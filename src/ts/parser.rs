use super::types::*;
use crate::error::{Result, SpliceError};

/// Parser for MPEG Transport Stream PSI sections.
///
/// Header and adaptation-field parsing live on `TsPacket` itself; this type
/// only decodes the PAT/PMT section bytes those headers point at.
/// - Program Association Table (PAT)
/// - Program Map Table (PMT)
#[derive(Debug)]
pub struct TSPacketParser {}

impl TSPacketParser {
    /// Creates a new TS packet parser.
    pub fn new() -> Self {
        Self {}
    }

    /// Parses a Program Association Table (PAT) section.
    pub fn parse_pat(&self, data: &[u8], _offset: usize, _length: usize) -> Result<PAT> {
        let mut pat = PAT::new();
        
        if data.len() < 8 {
            return Err(SpliceError::Psi("PAT section too short".into()));
        }

        if data[0] != TABLE_ID_PAT {
            return Err(SpliceError::Psi(format!("Invalid PAT table ID: 0x{:02x}", data[0])));
        }

        let section_length = ((data[1] as usize & 0x0F) << 8) | data[2] as usize;
        let total_length = 3 + section_length;

        if data.len() < total_length {
            return Err(SpliceError::Psi("PAT data shorter than section length".into()));
        }

        // Skip to start of programs (past TSID, version, section numbers)
        let mut pos = 8;
        
        // Read program entries until CRC
        while pos + 4 <= total_length - 4 {
            let program_number = ((data[pos] as u16) << 8) | data[pos + 1] as u16;
            let pid = ((data[pos + 2] as u16 & 0x1F) << 8) | data[pos + 3] as u16;
            
            pat.entries.push(PATEntry {
                program_number,
                network_pid: if program_number == 0 { pid } else { 0 },
                program_map_pid: if program_number != 0 { pid } else { 0 },
            });
            pos += 4;
        }

        Ok(pat)
    }

    /// Parses a Program Map Table (PMT) section.
    pub fn parse_pmt(&self, data: &[u8], _offset: usize, _length: usize) -> Result<PMT> {
        let mut pmt = PMT::new();

        if data.len() < 7 {
            return Err(SpliceError::Psi("PMT section too short".into()));
        }

        if data[0] != TABLE_ID_PMT {
            return Err(SpliceError::Psi(format!("Invalid PMT table ID: 0x{:02x}", data[0])));
        }

        let section_length = ((data[1] as usize & 0x0F) << 8) | data[2] as usize;
        let total_length = 3 + section_length;

        if data.len() < total_length {
            return Err(SpliceError::Psi("PMT data shorter than section length".into()));
        }

        let mut pos = 8;

        pmt.pcr_pid = ((data[pos] as u16 & 0x1F) << 8) | data[pos + 1] as u16;
        pos += 2;

        let program_info_length = ((data[pos] as usize & 0x0F) << 8) | data[pos + 1] as usize;
        pos += 2;

        if program_info_length > 0 {
            if pos + program_info_length > total_length - 4 {
                return Err(SpliceError::Psi("Program info extends beyond section".into()));
            }
            pmt.program_descriptors = self.parse_descriptors(&data[pos..pos + program_info_length])?;
            pos += program_info_length;
        }

        while pos + 5 <= total_length - 4 {
            let stream_type = data[pos];
            let elementary_pid = ((data[pos + 1] as u16 & 0x1F) << 8) | data[pos + 2] as u16;
            let es_info_length = ((data[pos + 3] as usize & 0x0F) << 8) | data[pos + 4] as usize;
            pos += 5;

            if pos + es_info_length > total_length - 4 {
                return Err(SpliceError::Psi("ES info extends beyond section".into()));
            }

            let descriptors = self.parse_descriptors(&data[pos..pos + es_info_length])?;
            pos += es_info_length;

            pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid,
                descriptors,
            });
        }

        Ok(pmt)
    }

    fn parse_descriptors(&self, data: &[u8]) -> Result<Vec<Descriptor>> {
        let mut descriptors = Vec::new();
        let mut pos = 0;

        while pos + 2 <= data.len() {
            let tag = data[pos];
            let length = data[pos + 1] as usize;
            pos += 2;

            if pos + length > data.len() {
                return Err(SpliceError::Psi("Descriptor data too short".into()));
            }

            descriptors.push(Descriptor {
                tag,
                data: data[pos..pos + length].to_vec(),
            });
            pos += length;
        }

        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pat() {
        let parser = TSPacketParser::new();
        let data = [
            TABLE_ID_PAT,
            0x80, 0x0D, // Section length (13 bytes)
            0x00, 0x01, // Transport stream ID
            0xC1, // Version and current_next
            0x00, 0x00, // Section numbers
            0x00, 0x01, // Program number
            0x10, 0x00, // PMT PID
            0x00, 0x00, 0x00, 0x00, // CRC32
        ];

        let pat = parser.parse_pat(&data, 0, data.len()).unwrap();
        assert_eq!(pat.entries.len(), 1);
        assert_eq!(pat.entries[0].program_number, 1);
        assert_eq!(pat.entries[0].program_map_pid, 0x1000);
    }
}
