#![allow(dead_code)]

use std::io::{Cursor, Write};

use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

/// Minimal pickle encoder for building test streams, protocol 2 and up.
/// Emits the binary opcode forms the reference writer prefers.
pub struct PickleBuilder {
    out: Vec<u8>,
}

impl PickleBuilder {
    pub fn new(proto: u8) -> Self {
        Self {
            out: vec![0x80, proto],
        }
    }

    /// Starts a builder with no PROTO preamble, for protocol-0 streams.
    pub fn bare() -> Self {
        Self {
            out: Vec::new(),
        }
    }

    pub fn op(mut self, byte: u8) -> Self {
        self.out.push(byte);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.out.extend_from_slice(bytes);
        self
    }

    pub fn line(mut self, text: &str) -> Self {
        self.out.extend_from_slice(text.as_bytes());
        self.out.push(b'\n');
        self
    }

    pub fn none(self) -> Self {
        self.op(b'N')
    }

    pub fn bool(self, value: bool) -> Self {
        self.op(if value { 0x88 } else { 0x89 })
    }

    pub fn int(mut self, value: i64) -> Self {
        if (0..256).contains(&value) {
            self.out.push(b'K');
            self.out.push(value as u8);
        } else if (256..65536).contains(&value) {
            self.out.push(b'M');
            self.out.extend_from_slice(&(value as u16).to_le_bytes());
        } else if i32::try_from(value).is_ok() {
            self.out.push(b'J');
            self.out.extend_from_slice(&(value as i32).to_le_bytes());
        } else {
            let body = minimal_twos_complement(value);
            self.out.push(0x8A);
            self.out.push(body.len() as u8);
            self.out.extend_from_slice(&body);
        }
        self
    }

    pub fn float(mut self, value: f64) -> Self {
        self.out.push(b'G');
        self.out.extend_from_slice(&value.to_bits().to_be_bytes());
        self
    }

    pub fn string(mut self, value: &str) -> Self {
        let bytes = value.as_bytes();
        if bytes.len() < 256 {
            self.out.push(0x8C);
            self.out.push(bytes.len() as u8);
        } else {
            self.out.push(b'X');
            self.out
                .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        }
        self.out.extend_from_slice(bytes);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        if value.len() < 256 {
            self.out.push(b'C');
            self.out.push(value.len() as u8);
        } else {
            self.out.push(b'B');
            self.out
                .extend_from_slice(&(value.len() as u32).to_le_bytes());
        }
        self.out.extend_from_slice(value);
        self
    }

    pub fn mark(self) -> Self {
        self.op(b'(')
    }

    pub fn empty_tuple(self) -> Self {
        self.op(b')')
    }

    pub fn empty_list(self) -> Self {
        self.op(b']')
    }

    pub fn empty_dict(self) -> Self {
        self.op(b'}')
    }

    pub fn empty_set(self) -> Self {
        self.op(0x8F)
    }

    pub fn tuple(self) -> Self {
        self.op(b't')
    }

    pub fn tuple2(self) -> Self {
        self.op(0x86)
    }

    pub fn appends(self) -> Self {
        self.op(b'e')
    }

    pub fn setitems(self) -> Self {
        self.op(b'u')
    }

    pub fn additems(self) -> Self {
        self.op(0x90)
    }

    pub fn frozenset(self) -> Self {
        self.op(0x91)
    }

    pub fn memoize(self) -> Self {
        self.op(0x94)
    }

    pub fn binget(mut self, index: u8) -> Self {
        self.out.push(b'h');
        self.out.push(index);
        self
    }

    pub fn global(
        self,
        module: &str,
        class: &str,
    ) -> Self {
        self.op(b'c').line(module).line(class)
    }

    pub fn reduce(self) -> Self {
        self.op(b'R')
    }

    pub fn build(self) -> Self {
        self.op(b'b')
    }

    pub fn binpersid(self) -> Self {
        self.op(b'Q')
    }

    pub fn frame(mut self, size: u64) -> Self {
        self.out.push(0x95);
        self.out.extend_from_slice(&size.to_le_bytes());
        self
    }

    pub fn stop(self) -> Self {
        self.op(b'.')
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    // Checkpoint-shaped helpers

    /// `("storage", <class>, <key>, "cpu", <numel>)` pushed through
    /// BINPERSID.
    pub fn storage_persid(
        self,
        class: &str,
        key: &str,
        numel: i64,
    ) -> Self {
        self.mark()
            .string("storage")
            .global("torch", class)
            .string(key)
            .string("cpu")
            .int(numel)
            .tuple()
            .binpersid()
    }

    pub fn int_tuple(
        mut self,
        values: &[i64],
    ) -> Self {
        self = self.mark();
        for value in values {
            self = self.int(*value);
        }
        self.tuple()
    }

    /// A full `_rebuild_tensor_v2` reduction over one storage.
    pub fn tensor(
        self,
        class: &str,
        key: &str,
        shape: &[i64],
    ) -> Self {
        let numel: i64 = shape.iter().product();
        let stride: Vec<i64> = shape
            .iter()
            .rev()
            .scan(1i64, |acc, dim| {
                let current = *acc;
                *acc *= dim;
                Some(current)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        self.global("torch._utils", "_rebuild_tensor_v2")
            .mark()
            .storage_persid(class, key, numel)
            .int(0)
            .int_tuple(shape)
            .int_tuple(&stride)
            .bool(false)
            .global("collections", "OrderedDict")
            .empty_tuple()
            .reduce()
            .tuple()
            .reduce()
    }
}

fn minimal_twos_complement(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut body = value.to_le_bytes().to_vec();
    while body.len() > 1 {
        let last = body[body.len() - 1];
        let prev = body[body.len() - 2];
        let redundant = (last == 0x00 && prev & 0x80 == 0)
            || (last == 0xFF && prev & 0x80 != 0);
        if !redundant {
            break;
        }
        body.pop();
    }
    body
}

/// Writes an uncompressed ZIP archive from (name, contents) pairs.
pub fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored);
    for (name, data) in entries {
        writer
            .start_file(*name, options)
            .expect("start archive entry");
        writer.write_all(data).expect("write archive entry");
    }
    writer.finish().expect("finish archive").into_inner()
}
