use lz4_flex::frame::{BlockMode, BlockSize, FrameInfo};
pub use lz4_flex::frame::{FrameDecoder as Decoder, FrameEncoder as Encoder};

use std::io::{self, Read, Write};

const LZ4_BLOCK_SIZE: BlockSize = BlockSize::Max64KB;

pub fn stream<W: Write>(w: W) -> Encoder<W> {
    let mut config = FrameInfo::new();

    config.block_size = LZ4_BLOCK_SIZE;
    config.block_mode = BlockMode::Linked;
    config.block_checksums = false;
    config.content_checksum = true;

    Encoder::with_frame_info(config, w)
}

pub fn destream<R: Read>(r: R) -> Decoder<R> {
    Decoder::new(r)
}

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = stream(Vec::with_capacity(data.len() / 2));
    encoder.write_all(data)?;
    encoder.finish().map_err(io::Error::other)
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = vec![];
    destream(data).read_to_end(&mut output)?;
    Ok(output)
}
