use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::Env;
use log::info;

use ngram_rulescore::arpa::NGramTable;
use ngram_rulescore::binary::{self, write_binary};
use ngram_rulescore::vocab::{ExternalId, BEGIN_SENTENCE, END_SENTENCE};
use ngram_rulescore::{read_sentences, Config, LanguageModel, ModelType};

#[derive(Parser, Debug)]
#[command(author, version, about = "N-Gram language model rule scoring", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short = 'q', long, global = true, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert an ARPA file to a binary model
    Build(BuildArgs),
    /// Score sentences, one per line
    Query(QueryArgs),
    /// Show what a model file holds
    Info(InfoArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Log10 probability of <unk> if an ARPA file lacks it
    #[arg(long, value_name = "LOGPROB", default_value_t = -100.0, allow_hyphen_values = true)]
    unk_logprob: f32,

    /// Buckets per entry in probing hash tables
    #[arg(long, value_name = "RATIO", default_value_t = 1.5)]
    probing_multiplier: f32,

    /// Largest word id a sentence may be given
    #[arg(long, value_name = "ID", default_value_t = 1 << 24)]
    max_word_id: u32,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// ARPA file to read
    arpa: PathBuf,

    /// Binary model to write
    output: PathBuf,

    /// Representation: probing, trie or fst
    #[arg(short = 't', long = "type", value_name = "TYPE", default_value = "probing")]
    model_type: ModelType,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Model file (ARPA, native binary or OpenFST)
    model: PathBuf,

    /// Read sentences from this file instead of standard input
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Do not add <s> and </s> around each sentence
    #[arg(long)]
    no_markers: bool,

    /// Representation to build when the model is ARPA text
    #[arg(short = 't', long = "type", value_name = "TYPE", default_value = "probing")]
    model_type: ModelType,

    #[command(flatten)]
    options: ModelArgs,
}

#[derive(Args, Debug)]
struct InfoArgs {
    /// Model file
    model: PathBuf,

    #[command(flatten)]
    options: ModelArgs,
}

impl ModelArgs {
    fn config(&self) -> Config {
        Config::default()
            .with_unknown_missing_logprob(self.unk_logprob)
            .with_probing_multiplier(self.probing_multiplier)
            .with_max_word_id(self.max_word_id)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Query(args) => run_query(args),
        Commands::Info(args) => run_info(args),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    use log::LevelFilter;

    let level = match (quiet, verbose) {
        (0, 0) => LevelFilter::Info,
        (0, 1) => LevelFilter::Debug,
        (0, _) => LevelFilter::Trace,
        (1, _) => LevelFilter::Warn,
        _ => LevelFilter::Error,
    };

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    builder.filter_level(level);
    let _ = builder.try_init();
}

fn run_build(args: BuildArgs) -> Result<()> {
    let config = args.model.config();
    let table = NGramTable::read_arpa(&args.arpa, config.unknown_missing_logprob)?;
    info!(
        "read {} n-grams of order {} from {}",
        table.len(),
        table.order(),
        args.arpa.display()
    );
    write_binary(&table, args.model_type, &args.output, &config)
        .with_context(|| format!("writing {}", args.output.display()))
}

fn run_query(args: QueryArgs) -> Result<()> {
    let config = args.options.config().with_arpa_representation(args.model_type);
    let mut lm = binary::load(&args.model, &config)?;
    let sentences = match &args.file {
        Some(path) => File::open(path)
            .map_err(anyhow::Error::from)
            .and_then(|fh| read_sentences(BufReader::new(fh)))
            .with_context(|| format!("reading {}", path.display()))?,
        None => read_sentences(io::stdin().lock()).context("reading standard input")?,
    };

    // Decoder ids are handed out in order of first appearance
    let mut ids: HashMap<String, ExternalId> = HashMap::new();
    let mut total = 0.0;
    let mut total_oov = 0;
    for words in &sentences {
        let mut sentence: Vec<&str> = Vec::with_capacity(words.len() + 2);
        if !args.no_markers {
            sentence.push(BEGIN_SENTENCE);
        }
        sentence.extend(words.iter().map(String::as_str));
        if !args.no_markers {
            sentence.push(END_SENTENCE);
        }
        let sentence_ids = sentence
            .iter()
            .map(|w| word_id(lm.as_mut(), &mut ids, w, config.max_word_id))
            .collect::<Result<Vec<ExternalId>>>()?;
        let oov = words
            .iter()
            .filter(|w| lm.is_out_of_vocabulary(ids[w.as_str()]))
            .count();
        let start = usize::from(!args.no_markers);
        let prob = lm.sentence_probability(&sentence_ids, start);
        println!("{}\t{:.4}\tOOV: {}", words.join(" "), prob, oov);
        total += prob;
        total_oov += oov;
    }
    println!("Total: {:.4}\tOOV: {}", total, total_oov);
    Ok(())
}

fn word_id(
    lm: &mut dyn LanguageModel,
    ids: &mut HashMap<String, ExternalId>,
    word: &str,
    max_word_id: ExternalId,
) -> Result<ExternalId> {
    if let Some(&id) = ids.get(word) {
        return Ok(id);
    }
    // Id 0 stays reserved for unknown words
    let id = ids.len() as ExternalId + 1;
    if id > max_word_id {
        bail!("more than {} distinct words in the input", max_word_id);
    }
    lm.register_word(word, id);
    ids.insert(word.to_string(), id);
    Ok(id)
}

fn run_info(args: InfoArgs) -> Result<()> {
    let format = binary::recognize(&args.model)?;
    let lm = binary::load(&args.model, &args.options.config())?;
    println!("file: {}", args.model.display());
    println!("format: {:?}", format);
    println!("representation: {}", lm.representation());
    println!("order: {}", lm.order());
    println!("vocabulary: {} words", lm.vocabulary().len());
    Ok(())
}
