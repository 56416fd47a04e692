use clap::Parser;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    long_about = "This program reads a folder with jsonl files of preference pairs \
    (a shared prompt with a chosen and a rejected continuation), tokenizes them and \
    writes training-ready batches."
)]
pub struct Cli {
    #[clap(short, long, help="Input to the root folder, should contain jsonl files like so - path/*.jsonl",
    value_hint=clap::ValueHint::DirPath)]
    pub input: String,
    #[clap(short, long, help = "Output folder, will write each jsonl as its own file.
    Eg. input/file.jsonl -> output/file.msgpack (padded) or output/file.arrow (packed)",
    value_hint=clap::ValueHint::DirPath)]
    pub output: String,
    #[clap(
        short,
        long,
        help = "Accepts huggingface <org>/<name> format for the tokenizer, or a path to a tokenizer.json"
    )]
    pub tokenizer: String,
    #[clap(short, long, default_value_t = 2048, help = "Max token length per sequence")]
    pub max_length: usize,
    #[clap(short, long, default_value_t = 8, help = "Examples per batch")]
    pub batch_size: usize,
    #[clap(long, help = "DPO mode: track prompt token lengths, drop over-long prompts, pad right")]
    pub dpo: bool,
    #[clap(long, help = "Pack each batch into one flat sequence with segment ids instead of padding")]
    pub packed: bool,
    #[clap(long, default_value_t = 1, help = "Align packed batch length to a multiple of this")]
    pub multiple_of: usize,
    #[clap(long, help = "Record key holding the prompt, if the records have one")]
    pub prompt_key: Option<String>,
    #[clap(long, default_value = "chosen", help = "Record key holding the chosen continuation")]
    pub chosen_key: String,
    #[clap(long, default_value = "rejected", help = "Record key holding the rejected continuation")]
    pub rejected_key: String,
    #[clap(long, help = "Format string for bare prompts, eg. 'Human: {}\\nAssistant: '")]
    pub input_template: Option<String>,
    #[clap(long, help = "Text marking where an answer begins; loss is scoped to the span after it")]
    pub response_template: Option<String>,
    #[clap(long, help = "Render records through the tokenizer's chat template")]
    pub apply_chat_template: bool,
}
