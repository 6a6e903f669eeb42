// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//!
//! Field level encoding of subnet message payloads.
//!
//! All integers are big-endian. Strings are `u16 length | utf8`, opaque data
//! blobs are `u32 length | bytes`, string maps are `u16 count | (key, value)*`.
//! Reads never panic on short input, they return `DecodeError` instead.
//!

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

///
/// Generate a checked reader for a fixed width integer.
///
macro_rules! define_fixed_reader {
    ($fn_name:ident, $ty:ty, $read_method:ident, $size:expr) => {
        pub fn $fn_name(buffer: &mut Bytes, field: &str) -> AppResult<$ty> {
            if buffer.remaining() < $size {
                return Err(AppError::DecodeError(format!(
                    "can not read {} as {}",
                    field,
                    stringify!($ty)
                )));
            }
            Ok(buffer.$read_method())
        }
    };
}

define_fixed_reader!(read_u16, u16, get_u16, 2);
define_fixed_reader!(read_u32, u32, get_u32, 4);
define_fixed_reader!(read_u64, u64, get_u64, 8);
define_fixed_reader!(read_i64, i64, get_i64, 8);

pub fn read_string(buffer: &mut Bytes, field: &str) -> AppResult<String> {
    let len = read_u16(buffer, field)? as usize;
    if buffer.remaining() < len {
        return Err(AppError::DecodeError(format!(
            "string {} declares {} bytes, {} left",
            field,
            len,
            buffer.remaining()
        )));
    }
    let raw = buffer.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| AppError::DecodeError(format!("string {} is not utf8: {}", field, e)))
}

pub fn read_data(buffer: &mut Bytes, field: &str) -> AppResult<Bytes> {
    let len = read_u32(buffer, field)? as usize;
    if buffer.remaining() < len {
        return Err(AppError::DecodeError(format!(
            "data {} declares {} bytes, {} left",
            field,
            len,
            buffer.remaining()
        )));
    }
    Ok(buffer.split_to(len))
}

pub fn read_string_map(buffer: &mut Bytes, field: &str) -> AppResult<HashMap<String, String>> {
    let count = read_u16(buffer, field)? as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_string(buffer, field)?;
        let value = read_string(buffer, field)?;
        map.insert(key, value);
    }
    Ok(map)
}

pub fn write_string(writer: &mut BytesMut, value: &str) -> AppResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        AppError::MessageTooLarge(format!("string of {} bytes exceeds u16", value.len()))
    })?;
    writer.put_u16(len);
    writer.put_slice(value.as_bytes());
    Ok(())
}

pub fn write_data(writer: &mut BytesMut, value: &[u8]) -> AppResult<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        AppError::MessageTooLarge(format!("data of {} bytes exceeds u32", value.len()))
    })?;
    writer.put_u32(len);
    writer.put_slice(value);
    Ok(())
}

pub fn write_string_map(writer: &mut BytesMut, map: &HashMap<String, String>) -> AppResult<()> {
    let count = u16::try_from(map.len()).map_err(|_| {
        AppError::MessageTooLarge(format!("map of {} entries exceeds u16", map.len()))
    })?;
    writer.put_u16(count);
    for (key, value) in map {
        write_string(writer, key)?;
        write_string(writer, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_reads_are_decode_errors() {
        let mut buffer = Bytes::from_static(&[0x00]);
        assert!(matches!(
            read_u16(&mut buffer, "cmd"),
            Err(AppError::DecodeError(_))
        ));

        // declares 5 bytes, carries 2
        let mut buffer = Bytes::from_static(&[0x00, 0x05, b'a', b'b']);
        assert!(matches!(
            read_string(&mut buffer, "module_id"),
            Err(AppError::DecodeError(_))
        ));

        let mut buffer = Bytes::from_static(&[0x00, 0x00, 0x00, 0x09, 0x01]);
        assert!(matches!(
            read_data(&mut buffer, "data"),
            Err(AppError::DecodeError(_))
        ));
    }

    #[test]
    fn test_string_layout() {
        let mut writer = BytesMut::new();
        write_string(&mut writer, "gate1").unwrap();
        assert_eq!(&writer[..], &[0x00, 0x05, b'g', b'a', b't', b'e', b'1']);
    }

    #[test]
    fn test_map_reads_back() {
        let mut map = HashMap::new();
        map.insert("_s0_uuid".to_string(), "u-1".to_string());
        map.insert("level".to_string(), "7".to_string());
        let mut writer = BytesMut::new();
        write_string_map(&mut writer, &map).unwrap();
        let mut buffer = writer.freeze();
        assert_eq!(read_string_map(&mut buffer, "session").unwrap(), map);
        assert!(!buffer.has_remaining());
    }

    #[test]
    fn test_oversized_string_rejected() {
        let mut writer = BytesMut::new();
        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            write_string(&mut writer, &long),
            Err(AppError::MessageTooLarge(_))
        ));
    }
}
