// Parallel jsonl -> tokenized pairs -> batches -> arrow/msgpack files.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use arrow::array::Int32Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressIterator, ProgressStyle};
use rayon::prelude::*;

use crate::collate::{collate, packing_collate, PackedBatch, PaddedBatch};
use crate::config::PreferenceConfig;
use crate::encoder::TokenEncoder;
use crate::preference::{build_pair, normalize_record, TokenizedPair};
use crate::template::ChatTemplate;
use crate::time_it;

/// Batch-assembly knobs shared across files.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub max_length: usize,
    pub batch_size: usize,
    pub multiple_of: usize,
    pub packed: bool,
}

/// Tokenize the response template once per run.
pub fn response_template_ids(
    config: &PreferenceConfig,
    encoder: &dyn TokenEncoder,
) -> Option<Vec<i32>> {
    config.response_template.as_deref().map(|text| {
        let (ids, _) = encoder.encode(text, usize::MAX);
        ids
    })
}

fn parse_and_tokenize(
    line: &str,
    config: &PreferenceConfig,
    template: Option<&ChatTemplate>,
    encoder: &dyn TokenEncoder,
    max_length: usize,
    response_ids: Option<&[i32]>,
) -> anyhow::Result<Option<TokenizedPair>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let data: serde_json::Value = serde_json::from_str(line).context("invalid json line")?;
    let Some(example) = normalize_record(&data, config, template, encoder, max_length)? else {
        // DPO mode drops prompts too long to leave room for an answer
        return Ok(None);
    };
    Ok(Some(build_pair(&example, encoder, max_length, response_ids)?))
}

/// Tokenize every record of a jsonl payload in parallel.
///
/// Collecting through rayon's `map` keeps line order, so the pair at
/// position `i` belongs to the `i`-th surviving record.
pub fn process_lines(
    jsonl: &str,
    config: &PreferenceConfig,
    template: Option<&ChatTemplate>,
    encoder: &dyn TokenEncoder,
    max_length: usize,
) -> anyhow::Result<Vec<TokenizedPair>> {
    let length = jsonl.lines().count();
    let style = ProgressStyle::with_template("Tokenizing: [{elapsed_precise} / {eta_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {per_sec}")
        .expect("Invalid progress style");
    let pb = ProgressBar::new(length as u64);
    pb.set_style(style);
    let response_ids = response_template_ids(config, encoder);
    let pairs: Vec<Option<TokenizedPair>> = jsonl
        .par_lines()
        .progress_with(pb)
        .map(|line| {
            parse_and_tokenize(
                line,
                config,
                template,
                encoder,
                max_length,
                response_ids.as_deref(),
            )
        })
        .collect::<anyhow::Result<_>>()?;
    Ok(pairs.into_iter().flatten().collect())
}

pub fn read_jsonl(
    jsonl_path: &str,
    config: &PreferenceConfig,
    template: Option<&ChatTemplate>,
    encoder: &dyn TokenEncoder,
    max_length: usize,
) -> anyhow::Result<Vec<TokenizedPair>> {
    println!("Reading jsonl file: {}", jsonl_path);
    let jsonl = time_it!("Time to read: ", fs::read_to_string(jsonl_path)?);
    println!("Number of lines: {}", jsonl.lines().count());
    process_lines(&jsonl, config, template, encoder, max_length)
}

pub fn collate_batches(
    pairs: &[TokenizedPair],
    batch_size: usize,
    is_dpo: bool,
    pad_token_id: i32,
) -> Vec<PaddedBatch> {
    pairs
        .chunks(batch_size.max(1))
        .map(|chunk| collate(chunk, is_dpo, pad_token_id))
        .collect()
}

pub fn packing_batches(
    pairs: &[TokenizedPair],
    batch_size: usize,
    multiple_of: usize,
    pad_token_id: i32,
) -> Vec<PackedBatch> {
    pairs
        .chunks(batch_size.max(1))
        .map(|chunk| packing_collate(chunk, multiple_of, pad_token_id))
        .collect()
}

fn out_path(jsonl_path: &str, out_folder: &str, extension: &str) -> String {
    let path = Path::new(jsonl_path);
    let file_stem = path.file_stem() // get the filename without extension
        .expect("Invalid file path")
        .to_str()
        .expect("Invalid file path");
    let mut out = Path::new(out_folder).join(file_stem);
    out.set_extension(extension);
    out.to_string_lossy().into_owned()
}

pub fn write_msgpack(batches: &[PaddedBatch], path: &str) -> anyhow::Result<()> {
    let encoded = rmp_serde::to_vec(batches)?;
    fs::write(path, encoded)?;
    Ok(())
}

/// One record batch per packed batch; sequence lengths are recoverable
/// from the segment id runs.
pub fn write_packed_arrow(batches: &[PackedBatch], path: &str) -> anyhow::Result<()> {
    let style = ProgressStyle::with_template("Writing: [{elapsed_precise} / {eta_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {per_sec}")
        .expect("Invalid progress style");
    let pb = ProgressBar::new(batches.len() as u64);
    pb.set_style(style);
    let schema = Schema::new(vec![
        Field::new("input_ids", DataType::Int32, false),
        Field::new("segment_ids", DataType::Int32, false),
    ]);
    let mut buffer = File::create(path).context("create file error")?;
    let mut writer = FileWriter::try_new(&mut buffer, &schema).context("Error creating writer")?;
    for batch in batches.iter().progress_with(pb) {
        let input_ids = Int32Array::from(batch.input_ids.clone());
        let segment_ids = Int32Array::from(batch.segment_ids.clone());
        let record = RecordBatch::try_new(
            Arc::new(schema.clone()),
            vec![Arc::new(input_ids), Arc::new(segment_ids)],
        )
        .context("Error creating record batch")?;
        writer.write(&record).context("Error writing to file")?;
    }
    writer.finish().context("Error finishing writing to file")?;
    Ok(())
}

/// Process one jsonl file end to end: tokenize, batch, write.
pub fn process_jsonl_file(
    jsonl_path: &str,
    out_folder: &str,
    config: &PreferenceConfig,
    template: Option<&ChatTemplate>,
    encoder: &dyn TokenEncoder,
    options: &ProcessOptions,
) -> anyhow::Result<()> {
    let pairs = read_jsonl(jsonl_path, config, template, encoder, options.max_length)?;
    println!("Tokenized {} pairs from {}", pairs.len(), jsonl_path);
    if options.packed {
        let batches = packing_batches(
            &pairs,
            options.batch_size,
            options.multiple_of,
            encoder.pad_token_id(),
        );
        write_packed_arrow(&batches, &out_path(jsonl_path, out_folder, "arrow"))?;
    } else {
        let batches = collate_batches(
            &pairs,
            options.batch_size,
            config.is_dpo,
            encoder.pad_token_id(),
        );
        write_msgpack(&batches, &out_path(jsonl_path, out_folder, "msgpack"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::{FakeEncoder, EOS, PAD};
    use crate::preference::Extra;

    const LINES: &str = r#"{"prompt": "2+2?", "chosen": " 4", "rejected": " 5"}
{"prompt": "3+3?", "chosen": " 6", "rejected": " 7", "margin": 1.5}

{"prompt": "name every prime number below one million", "chosen": " no", "rejected": " ok"}"#;

    fn config() -> PreferenceConfig {
        PreferenceConfig {
            prompt_key: Some("prompt".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_process_lines_preserves_order() {
        let pairs = process_lines(LINES, &config(), None, &FakeEncoder, 32).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].extra, Extra::Margin(0.0));
        assert_eq!(pairs[1].extra, Extra::Margin(1.5));
        for pair in &pairs {
            assert_eq!(*pair.chosen.input_ids.last().unwrap(), EOS);
            assert_eq!(*pair.rejected.input_ids.last().unwrap(), EOS);
        }
    }

    #[test]
    fn test_process_lines_drops_long_dpo_prompts() {
        let dpo = PreferenceConfig {
            is_dpo: true,
            ..config()
        };
        // third record's prompt tokenizes past max_length - 2
        let pairs = process_lines(LINES, &dpo, None, &FakeEncoder, 4).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].extra, Extra::PromptIdsLen(1));
    }

    #[test]
    fn test_process_lines_bad_json() {
        assert!(process_lines("not json", &config(), None, &FakeEncoder, 32).is_err());
    }

    #[test]
    fn test_batching_counts() {
        let pairs = process_lines(LINES, &config(), None, &FakeEncoder, 32).unwrap();
        let padded = collate_batches(&pairs, 2, false, PAD);
        assert_eq!(padded.len(), 2);
        assert_eq!(padded[0].chosen_ids.len(), 2);
        assert_eq!(padded[1].chosen_ids.len(), 1);

        let packed = packing_batches(&pairs, 2, 8, PAD);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0].input_ids.len() % 8, 0);
        assert_eq!(packed[0].packed_seq_lens.len(), 4);
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let pairs = process_lines(LINES, &config(), None, &FakeEncoder, 32).unwrap();
        let batches = collate_batches(&pairs, 2, false, PAD);
        let encoded = rmp_serde::to_vec(&batches).unwrap();
        let decoded: Vec<PaddedBatch> = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded.len(), batches.len());
        assert_eq!(decoded[0].chosen_ids, batches[0].chosen_ids);
        assert_eq!(decoded[0].extras, batches[0].extras);
    }

    #[test]
    fn test_out_path() {
        assert_eq!(out_path("data/train.jsonl", "out", "msgpack"), "out/train.msgpack");
        assert_eq!(out_path("data/train.jsonl", "out", "arrow"), "out/train.arrow");
    }

    #[test]
    fn test_response_template_ids() {
        let with = PreferenceConfig {
            response_template: Some("A:".to_string()),
            ..Default::default()
        };
        assert_eq!(response_template_ids(&with, &FakeEncoder).unwrap().len(), 1);
        assert!(response_template_ids(&PreferenceConfig::default(), &FakeEncoder).is_none());
    }
}
