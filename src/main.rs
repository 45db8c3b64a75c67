use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use xsp_segments::container::{decode_full_prefix, encode_full_prefix};
use xsp_segments::cryptor::{Cryptor, OsRng as SegOsRng, SegRng, XChaChaCryptor};
use xsp_segments::key::SegKey;
use xsp_segments::obj_source::{EncryptingObjSource, ObjSourceEvent, SliceObjSource};
use xsp_segments::reader::SegmentsReader;
use xsp_segments::writer::SegmentsWriter;

/// Demo CLI for the XSP segments engine: seals a file into a single-shot
/// `xsp` container and opens one back out, end to end.
#[derive(Parser, Debug)]
#[command(
    name = "xsp",
    bin_name = "xsp",
    about = "Pack and unpack XSP encrypted segment containers.",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt a file into an `xsp` container. Prints the 32-byte key as
    /// hex — hold onto it, there's no recovery without it.
    Seal {
        input: PathBuf,
        output: PathBuf,

        /// Segment size in units of 256 bytes.
        #[arg(long, default_value_t = 16)]
        seg_size_256b: u16,
    },
    /// Decrypt an `xsp` container back to a file, given its key.
    Open {
        input: PathBuf,
        output: PathBuf,

        /// 32-byte key, hex-encoded.
        #[arg(long)]
        key_hex: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("xsp_segments=info".parse().unwrap()),
        )
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Seal {
            input,
            output,
            seg_size_256b,
        } => seal(input, output, seg_size_256b).await,
        Command::Open {
            input,
            output,
            key_hex,
        } => open(input, output, key_hex).await,
    }
}

async fn seal(input: PathBuf, output: PathBuf, seg_size_256b: u16) -> Result<()> {
    let content = tokio::fs::read(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;

    let rng = Arc::new(SegOsRng);
    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&rng.fill(32));
    let key = SegKey::new(key_bytes);

    let mut zeroth_nonce = [0u8; xsp_segments::nonce::NONCE_LEN];
    zeroth_nonce.copy_from_slice(&rng.fill(xsp_segments::nonce::NONCE_LEN));

    let writer = SegmentsWriter::new(
        key,
        zeroth_nonce,
        seg_size_256b,
        0,
        0,
        rng,
        cryptor,
    )?;
    let source = SliceObjSource::new(content);
    let adapter = EncryptingObjSource::new(writer, source);

    let segments = Arc::new(tokio::sync::Mutex::new(Vec::<u8>::new()));
    let segments_for_event = segments.clone();
    let sealed_header = adapter
        .run(move |event| {
            let segments = segments_for_event.clone();
            Box::pin(async move {
                if let ObjSourceEvent::Seg { ciphertext, .. } = event {
                    segments.lock().await.extend_from_slice(&ciphertext);
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| anyhow!("packing failed: {e}"))?;

    let segments = Arc::try_unwrap(segments)
        .map_err(|_| anyhow!("segment buffer still shared"))?
        .into_inner();

    let prefix = encode_full_prefix(segments.len() as u64)?;
    let mut container = Vec::with_capacity(prefix.len() + segments.len() + sealed_header.len());
    container.extend_from_slice(&prefix);
    container.extend_from_slice(&segments);
    container.extend_from_slice(&sealed_header);

    tokio::fs::write(&output, &container)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    tracing::info!(bytes = container.len(), "sealed container");
    println!("key: {}", hex_encode(&key_bytes));
    Ok(())
}

async fn open(input: PathBuf, output: PathBuf, key_hex: String) -> Result<()> {
    let container = tokio::fs::read(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;

    let key_bytes = hex_decode(&key_hex).ok_or_else(|| anyhow!("key must be 64 hex characters"))?;
    let key = SegKey::new(key_bytes);
    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());

    let header_ofs = decode_full_prefix(&container)? as usize;
    let segments = &container[xsp_segments::container::PREFIX_LEN..xsp_segments::container::PREFIX_LEN + header_ofs];
    let sealed_header = &container[xsp_segments::container::PREFIX_LEN + header_ofs..];

    let reader = SegmentsReader::new(&key, 0, sealed_header, cryptor, None)?;
    let mut plaintext = Vec::new();
    for seg in reader.segment_infos(None) {
        let seg = seg?;
        let packed = &segments[seg.packed_ofs as usize..(seg.packed_ofs + seg.packed_len) as usize];
        plaintext.extend_from_slice(&reader.open_seg((seg.chain, seg.seg), packed)?);
    }

    tokio::fs::write(&output, &plaintext)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    tracing::info!(bytes = plaintext.len(), "opened container");
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let byte = u8::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
        out[i] = byte;
    }
    Some(out)
}
