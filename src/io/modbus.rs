//! MODBUS RTU framing
//!
//! Frame layout: slave address, function code, payload, CRC-16/MODBUS
//! (little-endian). Only the three function codes the facility hardware
//! uses are supported:
//! - 0x04 read input registers (space and presence sensors)
//! - 0x05 write single coil (barriers)
//! - 0x06 write single holding register (occupancy display)
//!
//! Every request is an 8 byte frame. Write responses echo the request;
//! read responses carry a byte count followed by big-endian register values.
//! Exception responses set the high bit of the function code and are 5 bytes.

use crc::{Crc, CRC_16_MODBUS};
use smallvec::SmallVec;
use std::time::Duration;
use thiserror::Error;

pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
const EXCEPTION_FLAG: u8 = 0x80;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Largest register block a single read may request
pub const MAX_READ_REGISTERS: u16 = 125;

pub const REQUEST_FRAME_LEN: usize = 8;
pub const EXCEPTION_FRAME_LEN: usize = 5;

// Facility address map
pub const COIL_ENTRY_BARRIER: u16 = 0x01;
pub const COIL_EXIT_BARRIER: u16 = 0x02;
pub const REG_DISPLAY: u16 = 0x03;
pub const REG_SPACE_SENSORS: u16 = 0x00;
pub const SPACE_SENSOR_COUNT: u16 = 8;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Serialised frame; every frame this crate builds fits inline except long reads
pub type Frame = SmallVec<[u8; 16]>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("CRC mismatch: expected 0x{expected:04X}, received 0x{received:04X}")]
    CrcMismatch { expected: u16, received: u16 },
    #[error("slave address mismatch: expected {expected}, received {received}")]
    SlaveMismatch { expected: u8, received: u8 },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("device exception 0x{code:02X} for function 0x{function:02X}")]
    Exception { function: u8, code: u8 },
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),
    #[error("serial I/O error: {0}")]
    Io(String),
}

impl BusFault {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            BusFault::Timeout(_) => "timeout",
            BusFault::CrcMismatch { .. } => "crc_mismatch",
            BusFault::SlaveMismatch { .. } => "slave_mismatch",
            BusFault::Malformed(_) => "malformed",
            BusFault::Exception { .. } => "exception",
            BusFault::PortUnavailable(_) => "port_unavailable",
            BusFault::Io(_) => "io",
        }
    }
}

#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

fn push_crc(frame: &mut Frame) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Validate the trailing CRC of a complete frame
fn check_crc(frame: &[u8]) -> Result<&[u8], BusFault> {
    if frame.len() < 4 {
        return Err(BusFault::Malformed(format!("frame too short ({} bytes)", frame.len())));
    }
    let body_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let expected = crc16(&frame[..body_len]);
    if received != expected {
        return Err(BusFault::CrcMismatch { expected, received });
    }
    Ok(&frame[..body_len])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    WriteCoil { address: u16, value: bool },
    ReadInputRegisters { address: u16, count: u16 },
    WriteHoldingRegister { address: u16, value: u16 },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::WriteCoil { .. } => FC_WRITE_SINGLE_COIL,
            Request::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            Request::WriteHoldingRegister { .. } => FC_WRITE_SINGLE_REGISTER,
        }
    }

    fn address_and_data(&self) -> (u16, u16) {
        match *self {
            Request::WriteCoil { address, value } => (address, if value { COIL_ON } else { COIL_OFF }),
            Request::ReadInputRegisters { address, count } => (address, count),
            Request::WriteHoldingRegister { address, value } => (address, value),
        }
    }

    pub fn encode(&self, slave: u8) -> Frame {
        let (address, data) = self.address_and_data();
        let mut frame = Frame::new();
        frame.push(slave);
        frame.push(self.function_code());
        frame.extend_from_slice(&address.to_be_bytes());
        frame.extend_from_slice(&data.to_be_bytes());
        push_crc(&mut frame);
        frame
    }

    /// Length of a successful response frame
    pub fn expected_response_len(&self) -> usize {
        match self {
            Request::ReadInputRegisters { count, .. } => 5 + 2 * usize::from(*count),
            Request::WriteCoil { .. } | Request::WriteHoldingRegister { .. } => REQUEST_FRAME_LEN,
        }
    }

    pub fn validate(&self) -> Result<(), BusFault> {
        if let Request::ReadInputRegisters { count, .. } = self {
            if *count == 0 || *count > MAX_READ_REGISTERS {
                return Err(BusFault::Malformed(format!("register count {} out of range", count)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    CoilWritten { address: u16, value: bool },
    InputRegisters(Vec<u16>),
    RegisterWritten { address: u16, value: u16 },
}

/// Number of bytes the response to `request` will occupy, given the first
/// two bytes received. `None` until enough of the header has arrived.
pub fn response_len(request: &Request, header: &[u8]) -> Option<usize> {
    let function = *header.get(1)?;
    if function & EXCEPTION_FLAG != 0 {
        Some(EXCEPTION_FRAME_LEN)
    } else {
        Some(request.expected_response_len())
    }
}

/// Validate and decode a response frame against the request that produced it
pub fn decode_response(slave: u8, request: &Request, frame: &[u8]) -> Result<Response, BusFault> {
    let body = check_crc(frame)?;

    if body[0] != slave {
        return Err(BusFault::SlaveMismatch { expected: slave, received: body[0] });
    }

    let function = body[1];
    if function == request.function_code() | EXCEPTION_FLAG {
        if frame.len() != EXCEPTION_FRAME_LEN {
            return Err(BusFault::Malformed(format!("exception frame of {} bytes", frame.len())));
        }
        return Err(BusFault::Exception { function: request.function_code(), code: body[2] });
    }
    if function != request.function_code() {
        return Err(BusFault::Malformed(format!(
            "function 0x{:02X} in reply to 0x{:02X}",
            function,
            request.function_code()
        )));
    }
    if frame.len() != request.expected_response_len() {
        return Err(BusFault::Malformed(format!(
            "length {} (expected {})",
            frame.len(),
            request.expected_response_len()
        )));
    }

    match *request {
        Request::ReadInputRegisters { count, .. } => {
            let byte_count = usize::from(body[2]);
            if byte_count != 2 * usize::from(count) {
                return Err(BusFault::Malformed(format!("byte count {}", byte_count)));
            }
            let values =
                body[3..].chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect();
            Ok(Response::InputRegisters(values))
        }
        Request::WriteCoil { .. } | Request::WriteHoldingRegister { .. } => {
            let echo_address = u16::from_be_bytes([body[2], body[3]]);
            let echo_data = u16::from_be_bytes([body[4], body[5]]);
            if (echo_address, echo_data) != request.address_and_data() {
                return Err(BusFault::Malformed("write echo does not match request".to_string()));
            }
            Ok(match *request {
                Request::WriteCoil { address, value } => Response::CoilWritten { address, value },
                _ => Response::RegisterWritten { address: echo_address, value: echo_data },
            })
        }
    }
}

/// Decode a request frame (slave side, used by the simulated device)
pub fn decode_request(frame: &[u8]) -> Result<(u8, Request), BusFault> {
    let body = check_crc(frame)?;
    if frame.len() != REQUEST_FRAME_LEN {
        return Err(BusFault::Malformed(format!("request of {} bytes", frame.len())));
    }
    let address = u16::from_be_bytes([body[2], body[3]]);
    let data = u16::from_be_bytes([body[4], body[5]]);
    let request = match body[1] {
        FC_WRITE_SINGLE_COIL => match data {
            COIL_ON => Request::WriteCoil { address, value: true },
            COIL_OFF => Request::WriteCoil { address, value: false },
            other => return Err(BusFault::Malformed(format!("coil value 0x{:04X}", other))),
        },
        FC_READ_INPUT_REGISTERS => Request::ReadInputRegisters { address, count: data },
        FC_WRITE_SINGLE_REGISTER => Request::WriteHoldingRegister { address, value: data },
        other => return Err(BusFault::Malformed(format!("unsupported function 0x{:02X}", other))),
    };
    Ok((body[0], request))
}

/// Encode a successful response (slave side)
pub fn encode_response(slave: u8, request: &Request, response: &Response) -> Frame {
    let mut frame = Frame::new();
    frame.push(slave);
    frame.push(request.function_code());
    match response {
        Response::InputRegisters(values) => {
            frame.push((values.len() * 2) as u8);
            for value in values {
                frame.extend_from_slice(&value.to_be_bytes());
            }
        }
        Response::CoilWritten { .. } | Response::RegisterWritten { .. } => {
            let (address, data) = request.address_and_data();
            frame.extend_from_slice(&address.to_be_bytes());
            frame.extend_from_slice(&data.to_be_bytes());
        }
    }
    push_crc(&mut frame);
    frame
}

/// Encode an exception response (slave side)
pub fn encode_exception(slave: u8, function: u8, code: u8) -> Frame {
    let mut frame = Frame::new();
    frame.push(slave);
    frame.push(function | EXCEPTION_FLAG);
    frame.push(code);
    push_crc(&mut frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_write_coil_frame() {
        let frame = Request::WriteCoil { address: COIL_ENTRY_BARRIER, value: true }.encode(1);
        assert_eq!(frame.len(), REQUEST_FRAME_LEN);
        assert_eq!(&frame[..6], &[0x01, 0x05, 0x00, 0x01, 0xFF, 0x00]);
        assert_eq!(u16::from_le_bytes([frame[6], frame[7]]), crc16(&frame[..6]));
    }

    #[test]
    fn test_read_input_registers_response() {
        let request = Request::ReadInputRegisters { address: REG_SPACE_SENSORS, count: 3 };
        let reply = encode_response(1, &request, &Response::InputRegisters(vec![1, 0, 0x0102]));
        assert_eq!(reply.len(), request.expected_response_len());
        assert_eq!(
            decode_response(1, &request, &reply).unwrap(),
            Response::InputRegisters(vec![1, 0, 0x0102])
        );
    }

    #[test]
    fn test_write_echo_decodes() {
        let request = Request::WriteHoldingRegister { address: REG_DISPLAY, value: 5 };
        let reply = encode_response(1, &request, &Response::RegisterWritten { address: 3, value: 5 });
        assert_eq!(
            decode_response(1, &request, &reply).unwrap(),
            Response::RegisterWritten { address: REG_DISPLAY, value: 5 }
        );
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let request = Request::WriteCoil { address: COIL_EXIT_BARRIER, value: true };
        let mut reply = encode_response(1, &request, &Response::CoilWritten { address: 2, value: true });
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        assert!(matches!(decode_response(1, &request, &reply), Err(BusFault::CrcMismatch { .. })));
    }

    #[test]
    fn test_slave_mismatch_rejected() {
        let request = Request::WriteCoil { address: COIL_ENTRY_BARRIER, value: false };
        let reply = encode_response(2, &request, &Response::CoilWritten { address: 1, value: false });
        assert_eq!(
            decode_response(1, &request, &reply),
            Err(BusFault::SlaveMismatch { expected: 1, received: 2 })
        );
    }

    #[test]
    fn test_malformed_length_rejected() {
        let request = Request::ReadInputRegisters { address: 0, count: 2 };
        // Valid CRC but only one register of payload
        let short = encode_response(1, &request, &Response::InputRegisters(vec![7]));
        assert!(matches!(decode_response(1, &request, &short), Err(BusFault::Malformed(_))));
        assert!(matches!(decode_response(1, &request, &[0x01, 0x04]), Err(BusFault::Malformed(_))));
    }

    #[test]
    fn test_exception_frame() {
        let request = Request::WriteHoldingRegister { address: REG_DISPLAY, value: 1 };
        let reply = encode_exception(1, FC_WRITE_SINGLE_REGISTER, 0x02);
        assert_eq!(response_len(&request, &reply), Some(EXCEPTION_FRAME_LEN));
        assert_eq!(
            decode_response(1, &request, &reply),
            Err(BusFault::Exception { function: FC_WRITE_SINGLE_REGISTER, code: 0x02 })
        );
    }

    #[test]
    fn test_echo_mismatch_rejected() {
        let request = Request::WriteCoil { address: COIL_ENTRY_BARRIER, value: true };
        let other = Request::WriteCoil { address: COIL_ENTRY_BARRIER, value: false };
        let reply = encode_response(1, &other, &Response::CoilWritten { address: 1, value: false });
        assert!(matches!(decode_response(1, &request, &reply), Err(BusFault::Malformed(_))));
    }

    #[test]
    fn test_decode_request() {
        let request = Request::ReadInputRegisters { address: 0x08, count: 1 };
        assert_eq!(decode_request(&request.encode(7)).unwrap(), (7, request));

        let mut bad = Request::WriteCoil { address: 1, value: true }.encode(1);
        bad[4] = 0x12;
        let crc = crc16(&bad[..6]).to_le_bytes();
        bad[6] = crc[0];
        bad[7] = crc[1];
        assert!(matches!(decode_request(&bad), Err(BusFault::Malformed(_))));
    }

    #[test]
    fn test_request_validation() {
        assert!(Request::ReadInputRegisters { address: 0, count: 0 }.validate().is_err());
        assert!(Request::ReadInputRegisters { address: 0, count: 126 }.validate().is_err());
        assert!(Request::ReadInputRegisters { address: 0, count: 8 }.validate().is_ok());
    }
}
