//! Wire Protocol Constants

// Default relay port
pub const DEFAULT_PORT: u16 = 5656;

// Size of the frame length prefix and of the nested name length field
pub const FRAME_LENGTH_SIZE: usize = 2;
pub const NAME_LENGTH_SIZE: usize = 2;

// Largest payload a u16 length prefix can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// Largest name that still leaves room for the name length field
pub const MAX_NAME_LEN: usize = MAX_PAYLOAD_LEN - NAME_LENGTH_SIZE;
