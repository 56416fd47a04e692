// src/globals.rs
use std::sync::OnceLock;
use tokenizers;

/// Tokenizer object
///
/// This is a `OnceLock<tokenizers::Tokenizer>` that will be initialized when called with
/// `get_or_init` and a closure that returns a `tokenizers::Tokenizer`
static TOKENIZER: OnceLock<tokenizers::Tokenizer> = OnceLock::new();

/// Helper function to tokenize directly
///
/// This function will tokenize the content and return the encoding directly, abstracting
/// the need to call `get` and `unwrap` on the OnceLock. No special tokens are added;
/// truncation is handled by the caller.
///
/// # Panics
///
/// This function will panic if the tokenizer has not been initialized
pub fn tokenize(content: &str) -> tokenizers::Encoding {
    tokenizer().encode(content, false).unwrap()
}

/// Access the process-wide tokenizer.
///
/// # Panics
///
/// This function will panic if the tokenizer has not been initialized
pub fn tokenizer() -> &'static tokenizers::Tokenizer {
    TOKENIZER.get().expect("Tokenizer has not been initialized")
}

/// Helper function to initialize the tokenizer
///
/// This may be called at the beginning of the program if choosing to use a specific tokenizer
///
/// # Arguments
///
/// * `tokenizer_name` - `&String` - The name of the tokenizer to use, this should be in the
///   format of `huggingface <org>/<name>` or a path to a tokenizer.json file
pub fn init_tokenizer(tokenizer_name: &String) {
    if tokenizer_name.ends_with(".json") {
        println!("Loading tokenizer from file: {}", tokenizer_name);
        TOKENIZER
            .set(tokenizers::Tokenizer::from_file(tokenizer_name).unwrap())
            .expect("Unable to load tokenizer");
    } else {
        println!("Loading tokenizer: {}", tokenizer_name);
        TOKENIZER
            .set(tokenizers::Tokenizer::from_pretrained(tokenizer_name, None).unwrap())
            .expect("Unable to load tokenizer");
    }
}
