//! Primitive MQTT data representations: variable byte integers,
//! length-prefixed UTF-8 strings and binary data.

pub mod binary;
pub mod string;
pub mod variable_int;

pub use binary::{binary_len, decode_binary, encode_binary};
pub use string::{decode_string, decode_string_pair, encode_string, string_len};
pub use variable_int::{
    decode_variable_int, encode_variable_int, peek_variable_int, variable_int_len, VariableInt,
    VARIABLE_INT_MAX,
};
