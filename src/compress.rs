/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! LZ4 and Zstd wrappers with reusable per-thread contexts */
use crate::tag;
use crate::util::Compression;

/** Compression contexts, allocated lazily per worker thread */
pub struct CompCtx {
    #[cfg(feature = "zstd")]
    zstd: Option<(i8, zstd::bulk::Compressor<'static>)>,
}

/** Decompression contexts, allocated lazily per worker thread */
pub struct DecompCtx {
    #[cfg(feature = "zstd")]
    zstd: Option<zstd::bulk::Decompressor<'static>>,
}

impl CompCtx {
    pub fn new() -> CompCtx {
        CompCtx {
            #[cfg(feature = "zstd")]
            zstd: None,
        }
    }
}
impl DecompCtx {
    pub fn new() -> DecompCtx {
        DecompCtx {
            #[cfg(feature = "zstd")]
            zstd: None,
        }
    }
}

#[cfg(feature = "zstd")]
fn zstd_compressor<'a>(
    ctx: &'a mut CompCtx,
    level: i8,
) -> Result<&'a mut zstd::bulk::Compressor<'static>, String> {
    let needs_new = match ctx.zstd {
        Some((l, _)) => l != level,
        None => true,
    };
    if needs_new {
        let c = zstd::bulk::Compressor::new(level as i32)
            .map_err(|x| tag!("Failed to create Zstd compression context: {}", x))?;
        ctx.zstd = Some((level, c));
    }
    Ok(&mut ctx.zstd.as_mut().unwrap().1)
}

/** Create a vector containing the compressed input, preceded by `pad_pre`
 * zeros and followed by `pad_post` zeros.
 *
 * Typically used with pad_pre = 16 so a message header can be written in
 * front without copying the payload. `Compression::None` copies the input. */
pub fn compress_to_vec(
    comp: Compression,
    ctx: &mut CompCtx,
    input: &[u8],
    pad_pre: usize,
    pad_post: usize,
) -> Result<Vec<u8>, String> {
    match comp {
        Compression::None => {
            let mut v = vec![0_u8; pad_pre + input.len() + pad_post];
            v[pad_pre..pad_pre + input.len()].copy_from_slice(input);
            Ok(v)
        }
        #[cfg(feature = "lz4")]
        Compression::Lz4(_lvl) => {
            /* The block encoder has a single (fast) level; the configured
             * level is accepted for compatibility but does not change it */
            let bound = lz4_flex::block::get_maximum_output_size(input.len());
            let mut v = vec![0_u8; pad_pre + bound + pad_post];
            let n = lz4_flex::block::compress_into(input, &mut v[pad_pre..pad_pre + bound])
                .map_err(|x| tag!("Failed to compress {} bytes with LZ4: {}", input.len(), x))?;
            v.truncate(pad_pre + n + pad_post);
            v[pad_pre + n..].fill(0);
            Ok(v)
        }
        #[cfg(feature = "zstd")]
        Compression::Zstd(lvl) => {
            let bound = zstd::zstd_safe::compress_bound(input.len());
            let mut v = vec![0_u8; pad_pre + bound + pad_post];
            let c = zstd_compressor(ctx, lvl)?;
            let n = c
                .compress_to_buffer(input, &mut v[pad_pre..pad_pre + bound])
                .map_err(|x| tag!("Failed to compress {} bytes with Zstd: {}", input.len(), x))?;
            v.truncate(pad_pre + n + pad_post);
            v[pad_pre + n..].fill(0);
            Ok(v)
        }
        #[cfg(not(feature = "lz4"))]
        Compression::Lz4(_) => Err(tag!("Built without LZ4 support")),
        #[cfg(not(feature = "zstd"))]
        Compression::Zstd(_) => Err(tag!("Built without Zstd support")),
    }
}

/** Decompress `input` into exactly `dst.len()` bytes; errors if the input
 * is malformed or decompresses to any other length. */
pub fn decompress_to_slice(
    comp: Compression,
    ctx: &mut DecompCtx,
    input: &[u8],
    dst: &mut [u8],
) -> Result<(), String> {
    match comp {
        Compression::None => {
            if input.len() != dst.len() {
                return Err(tag!(
                    "Uncompressed payload has {} bytes, expected {}",
                    input.len(),
                    dst.len()
                ));
            }
            dst.copy_from_slice(input);
            Ok(())
        }
        #[cfg(feature = "lz4")]
        Compression::Lz4(_) => {
            let n = lz4_flex::block::decompress_into(input, dst)
                .map_err(|x| tag!("Failed to decompress LZ4 payload: {}", x))?;
            if n != dst.len() {
                return Err(tag!(
                    "LZ4 payload decompressed to {} bytes, expected {}",
                    n,
                    dst.len()
                ));
            }
            Ok(())
        }
        #[cfg(feature = "zstd")]
        Compression::Zstd(_) => {
            if ctx.zstd.is_none() {
                ctx.zstd = Some(
                    zstd::bulk::Decompressor::new()
                        .map_err(|x| tag!("Failed to create Zstd decompression context: {}", x))?,
                );
            }
            let d = ctx.zstd.as_mut().unwrap();
            let n = d
                .decompress_to_buffer(input, dst)
                .map_err(|x| tag!("Failed to decompress Zstd payload: {}", x))?;
            if n != dst.len() {
                return Err(tag!(
                    "Zstd payload decompressed to {} bytes, expected {}",
                    n,
                    dst.len()
                ));
            }
            Ok(())
        }
        #[cfg(not(feature = "lz4"))]
        Compression::Lz4(_) => Err(tag!("Built without LZ4 support")),
        #[cfg(not(feature = "zstd"))]
        Compression::Zstd(_) => Err(tag!("Built without Zstd support")),
    }
}
