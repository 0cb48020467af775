//! Hash a random image/text batch and compare the codes.
//!
//! ```text
//! RUST_LOG=concept_hash=debug cargo run --example hash_demo
//! ```

use concept_hash::layers::Parameterized;
use concept_hash::prelude::*;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = HashConfig::default()
        .with_embed_dim(64)
        .with_k_bits(16)
        .with_top_k_label(4);
    let device = best_device();
    let model = HashingModel::new(&config, &device)?;
    println!("parameters: {}", model.param_count());

    let (n, l_img, l_txt, d) = (4, 50, 12, config.embed_dim);
    let img_tokens = Tensor::randn(0.0f32, 1.0, (l_img, n, d), &device)?;
    let txt_tokens = Tensor::randn(0.0f32, 1.0, (l_txt, n, d), &device)?;
    let img_cls = Tensor::randn(0.0f32, 1.0, (n, d), &device)?;
    let txt_eos = Tensor::randn(0.0f32, 1.0, (n, d), &device)?;

    // Sample i has i padded text tokens at the end
    let padding: Vec<u8> = (0..n)
        .flat_map(|i| (0..l_txt).map(move |j| u8::from(j + i >= l_txt)))
        .collect();
    let padding = Tensor::from_vec(padding, (n, l_txt), &device)?;

    let out = model.forward(&img_tokens, &txt_tokens, &img_cls, &txt_eos, Some(&padding), false)?;
    let (Some(image), Some(text)) = (out.image, out.text) else {
        return Err(HashCoreError::Shape("forward returned a partial output".into()));
    };

    let img_codes = binarize(&image.token_hash)?;
    let txt_codes = binarize(&text.token_hash)?;
    for (i, row) in img_codes.to_vec2::<f32>()?.iter().enumerate() {
        let bits: String = row.iter().map(|b| if *b > 0.0 { '1' } else { '0' }).collect();
        println!("image {}: {}", i, bits);
    }

    let dist = hamming_distance(&img_codes, &txt_codes)?;
    println!("image x text hamming distances:");
    for row in dist.to_vec2::<f32>()? {
        println!("  {:?}", row);
    }

    Ok(())
}
