/// Little-endian frame reader. Every accessor returns `None` on a short read.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let start = self.pos;
        self.pos += len;
        Some(&self.data[start..start + len])
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Some(array)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|bytes| bytes[0])
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Option<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_string_lossy(&mut self) -> Option<String> {
        let len = self.read_u16_le()? as usize;
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).to_string())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    data: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32_le(&mut self, value: f32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// u16 length prefix; longer strings are truncated at a char boundary.
    pub fn write_string_str(&mut self, value: &str) {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_u16_le(end as u16);
        self.data.extend_from_slice(&value.as_bytes()[..end]);
    }
}
