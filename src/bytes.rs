// SPDX-License-Identifier: MIT

pub(crate) fn write_u16(buffer: &mut [u8], value: u16) {
    buffer[..2].copy_from_slice(&value.to_ne_bytes())
}

pub(crate) fn write_u32(buffer: &mut [u8], value: u32) {
    buffer[..4].copy_from_slice(&value.to_ne_bytes())
}

pub(crate) fn write_i32(buffer: &mut [u8], value: i32) {
    buffer[..4].copy_from_slice(&value.to_ne_bytes())
}
