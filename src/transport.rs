//! Framed packet transport over any async byte stream

pub mod packet_io;

pub use packet_io::{PacketReader, PacketWriter};
