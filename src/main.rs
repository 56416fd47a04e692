use std::fs;
use std::path::Path;

use clap::Parser;
use rayon::prelude::*;

use prefpack::args::Cli;
use prefpack::config::{self, PreferenceConfig};
use prefpack::dataset::{self, ProcessOptions};
use prefpack::encoder::HfTokenEncoder;
use prefpack::globals;
use prefpack::template::ChatTemplate;

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    // check if output folder exists
    if !Path::new(&args.output).exists() {
        fs::create_dir(&args.output)?;
    }

    globals::init_tokenizer(&args.tokenizer);
    // local tokenizer.json files have no hub config to fetch
    let (encoder, template) = if args.tokenizer.ends_with(".json") {
        anyhow::ensure!(
            !args.apply_chat_template,
            "--apply-chat-template needs a hub tokenizer id, local tokenizer.json files carry no chat template"
        );
        (HfTokenEncoder::from_tokenizer()?, None)
    } else {
        let tokenizer_config = config::read_config(&args.tokenizer)
            .map_err(|e| anyhow::anyhow!("failed to read tokenizer config: {}", e))?;
        let encoder = HfTokenEncoder::from_config(&tokenizer_config)?;
        let template = args
            .apply_chat_template
            .then(|| ChatTemplate::from_config(tokenizer_config));
        (encoder, template)
    };

    let config = PreferenceConfig {
        prompt_key: args.prompt_key.clone(),
        chosen_key: args.chosen_key.clone(),
        rejected_key: args.rejected_key.clone(),
        input_template: args.input_template.clone(),
        response_template: args.response_template.clone(),
        is_dpo: args.dpo,
    };
    let options = ProcessOptions {
        max_length: args.max_length,
        batch_size: args.batch_size,
        multiple_of: args.multiple_of,
        packed: args.packed,
    };

    let paths = fs::read_dir(&args.input)?;
    paths // filter only jsonl files
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            if path.extension()?.to_str()? == "jsonl" {
                Some(path)
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .par_iter()
        .map(|path| {
            let path = path.to_string_lossy();
            dataset::process_jsonl_file(
                &path,
                &args.output,
                &config,
                template.as_ref(),
                &encoder,
                &options,
            )
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(())
}
