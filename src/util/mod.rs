pub mod byte_buffer;
pub mod ordered_map;
pub mod varint;
