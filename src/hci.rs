//! Byte-level encoding of the few HCI exchanges the sampler needs: the
//! connection info request, the Read RSSI command and its events.

use mac_address::MacAddress;
use thiserror::Error;

pub const ACL_LINK: u8 = 0x01;

pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;

pub const EVT_CMD_COMPLETE: u8 = 0x0e;
pub const EVT_CMD_STATUS: u8 = 0x0f;

pub const OGF_STATUS_PARAM: u16 = 0x05;
pub const OCF_READ_RSSI: u16 = 0x0005;

/// `struct hci_conn_info_req` followed by one `struct hci_conn_info`.
pub const CONN_INFO_REQ_LEN: usize = 24;
const CONN_INFO_HANDLE_OFFSET: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("truncated packet: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("command failed with status 0x{0:02x}")]
    Status(u8),

    #[error("response for connection handle {got}, expected {expected}")]
    HandleMismatch { expected: u16, got: u16 },
}

pub fn opcode(ogf: u16, ocf: u16) -> u16 {
    (ocf & 0x03ff) | (ogf << 10)
}

pub fn read_rssi_opcode() -> u16 {
    opcode(OGF_STATUS_PARAM, OCF_READ_RSSI)
}

/// Kernel `bdaddr_t` order is the reverse of the printed form.
pub fn bdaddr(address: &MacAddress) -> [u8; 6] {
    let mut bytes = address.bytes();
    bytes.reverse();
    bytes
}

pub fn conn_info_request(address: &MacAddress) -> [u8; CONN_INFO_REQ_LEN] {
    let mut request = [0u8; CONN_INFO_REQ_LEN];
    request[..6].copy_from_slice(&bdaddr(address));
    request[6] = ACL_LINK;
    request
}

pub fn conn_info_handle(response: &[u8]) -> Result<u16, HciError> {
    let end = CONN_INFO_HANDLE_OFFSET + 2;
    if response.len() < end {
        return Err(HciError::Truncated {
            expected: end,
            actual: response.len(),
        });
    }
    Ok(u16::from_le_bytes([
        response[CONN_INFO_HANDLE_OFFSET],
        response[CONN_INFO_HANDLE_OFFSET + 1],
    ]))
}

pub fn read_rssi_command(handle: u16) -> Vec<u8> {
    let [op_lo, op_hi] = read_rssi_opcode().to_le_bytes();
    let [h_lo, h_hi] = handle.to_le_bytes();
    vec![HCI_COMMAND_PKT, op_lo, op_hi, 2, h_lo, h_hi]
}

/// Inspects one packet read from the HCI socket. Returns the return
/// parameters of the Command Complete event for `expected_opcode`, `None`
/// for unrelated traffic, or an error when the controller rejected the
/// command.
pub fn command_complete(packet: &[u8], expected_opcode: u16) -> Result<Option<&[u8]>, HciError> {
    if packet.len() < 3 || packet[0] != HCI_EVENT_PKT {
        return Ok(None);
    }
    let event = packet[1];
    let plen = packet[2] as usize;
    let payload = &packet[3..];
    if payload.len() < plen {
        return Err(HciError::Truncated {
            expected: plen + 3,
            actual: packet.len(),
        });
    }
    let payload = &payload[..plen];

    match event {
        EVT_CMD_COMPLETE => {
            // ncmd(1) opcode(2) return parameters...
            if payload.len() < 3 {
                return Err(HciError::Truncated {
                    expected: 6,
                    actual: packet.len(),
                });
            }
            let op = u16::from_le_bytes([payload[1], payload[2]]);
            if op != expected_opcode {
                return Ok(None);
            }
            Ok(Some(&payload[3..]))
        }
        EVT_CMD_STATUS => {
            // status(1) ncmd(1) opcode(2)
            if payload.len() < 4 {
                return Err(HciError::Truncated {
                    expected: 7,
                    actual: packet.len(),
                });
            }
            let op = u16::from_le_bytes([payload[2], payload[3]]);
            if op != expected_opcode || payload[0] == 0 {
                return Ok(None);
            }
            Err(HciError::Status(payload[0]))
        }
        _ => Ok(None),
    }
}

/// Read RSSI return parameters: status(1) handle(2) rssi(1).
pub fn read_rssi_result(params: &[u8], handle: u16) -> Result<i8, HciError> {
    if params.len() < 4 {
        return Err(HciError::Truncated {
            expected: 4,
            actual: params.len(),
        });
    }
    if params[0] != 0 {
        return Err(HciError::Status(params[0]));
    }
    let got = u16::from_le_bytes([params[1], params[2]]);
    if got != handle {
        return Err(HciError::HandleMismatch {
            expected: handle,
            got,
        });
    }
    Ok(params[3] as i8)
}
