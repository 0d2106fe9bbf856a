use std::path::Path;
use std::process;

use bytesize::ByteSize;
use clap::ValueEnum;
use env_logger;
use log;

use par_ext_sort::{
    split_file, BinaryCodec, ExternalSorterBuilder, MemoryLimitedBufferBuilder, MergeStrategy, RecordCodec, RmpCodec,
    SortError, TextCodec,
};

fn main() {
    let arg_parser = build_arg_parser();

    let (command, args) = match arg_parser.subcommand() {
        Some((command, args)) => (command, args),
        None => unreachable!("subcommand is required"),
    };

    let log_level: LogLevel = args.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let format: Format = args.value_of_t_or_exit("format");
    let result = match (command, format) {
        ("sort", Format::Text) => sort(args, TextCodec),
        ("sort", Format::Binary) => sort(args, BinaryCodec),
        ("sort", Format::Msgpack) => sort(args, RmpCodec),
        ("split", Format::Text) => split(args, TextCodec),
        ("split", Format::Binary) => split(args, BinaryCodec),
        ("split", Format::Msgpack) => split(args, RmpCodec),
        _ => unreachable!("unknown subcommand"),
    };

    if let Err(err) = result {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn sort<C: RecordCodec>(args: &clap::ArgMatches, codec: C) -> Result<(), SortError> {
    let input = args.value_of("input").expect("value is required");
    let output = args.value_of("output").expect("value is required");
    let strategy: Strategy = args.value_of_t_or_exit("strategy");

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_codec(codec)
        .with_strategy(match strategy {
            Strategy::Incremental => MergeStrategy::Incremental,
            Strategy::Flat => MergeStrategy::Flat,
        });

    if args.is_present("threads") {
        sorter_builder = sorter_builder.with_threads_number(args.value_of_t_or_exit("threads"));
    }

    if args.is_present("merge_concurrency") {
        sorter_builder = sorter_builder.with_merge_concurrency(args.value_of_t_or_exit("merge_concurrency"));
    }

    if let Some(tmp_dir) = args.value_of("tmp_dir") {
        sorter_builder = sorter_builder.with_tmp_dir(Path::new(tmp_dir));
    }

    if let Some(buf_size) = rw_buf_size(args) {
        sorter_builder = sorter_builder.with_rw_buf_size(buf_size);
    }

    let sorter = sorter_builder.with_parallel_chunk_sort(args.is_present("parallel")).build()?;
    let summary = sorter.sort_directory(Path::new(input), Path::new(output))?;

    log::info!(
        "partitions sorted: {}, partitions skipped: {}, merges: {}, records: {}",
        summary.partitions_sorted,
        summary.partitions_skipped,
        summary.merges,
        summary.records
    );

    return Ok(());
}

fn split<C: RecordCodec>(args: &clap::ArgMatches, codec: C) -> Result<(), SortError> {
    let input = args.value_of("input").expect("value is required");
    let output = args.value_of("output").expect("value is required");
    let chunk_size = args.value_of("chunk_size").expect("value is required");

    let buffer_builder =
        MemoryLimitedBufferBuilder::new(chunk_size.parse::<ByteSize>().expect("value is pre-validated").as_u64());

    split_file(Path::new(input), Path::new(output), codec, &buffer_builder, rw_buf_size(args))?;

    return Ok(());
}

fn rw_buf_size(args: &clap::ArgMatches) -> Option<usize> {
    args.value_of("rw_buf_size")
        .map(|v| parse_buf_size(v).expect("value is pre-validated"))
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ValueEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum Format {
    Text,
    Binary,
    Msgpack,
}

impl Format {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Format::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Format as clap::ValueEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum Strategy {
    Incremental,
    Flat,
}

impl Strategy {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Strategy::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Strategy as clap::ValueEnum>::from_str(s, false)
    }
}

fn validate_size(v: &str) -> Result<(), String> {
    match v.parse::<ByteSize>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn parse_buf_size(v: &str) -> Result<usize, String> {
    let size = v.parse::<ByteSize>().map_err(|err| format!("size format incorrect: {}", err))?;
    match usize::try_from(size.as_u64()) {
        Ok(0) => Err("buffer size must be positive".to_string()),
        Ok(size) => Ok(size),
        Err(_) => Err(format!("buffer size {} is too large for this platform", size)),
    }
}

fn validate_buf_size(v: &str) -> Result<(), String> {
    parse_buf_size(v).map(|_| ())
}

fn common_args(command: clap::Command<'static>) -> clap::Command<'static> {
    command
        .arg(
            clap::Arg::new("format")
                .short('f')
                .long("format")
                .help("record encoding")
                .takes_value(true)
                .default_value("text")
                .possible_values(Format::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("rw_buf_size")
                .long("rw-buf-size")
                .help("file read/write buffer size")
                .takes_value(true)
                .validator(validate_buf_size),
        )
}

fn build_arg_parser() -> clap::ArgMatches {
    let sort_command = clap::Command::new("sort")
        .about("sort a directory of partitions into a single file")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("directory of partitions to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of worker threads")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("merge_concurrency")
                .short('m')
                .long("merge-concurrency")
                .help("maximum number of merges running at once")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("strategy")
                .short('s')
                .long("strategy")
                .help("merge strategy")
                .takes_value(true)
                .default_value("incremental")
                .possible_values(Strategy::possible_values()),
        )
        .arg(
            clap::Arg::new("parallel")
                .short('p')
                .long("parallel-chunk-sort")
                .help("sort each chunk with multiple threads"),
        );

    let split_command = clap::Command::new("split")
        .about("split a file into unsorted partitions")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be split")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("partitions directory")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("partition size")
                .required(true)
                .takes_value(true)
                .validator(validate_size),
        );

    clap::Command::new("par-ext-sort")
        .about("concurrent external sorter")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(common_args(sort_command))
        .subcommand(common_args(split_command))
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::parse_buf_size;

    #[rstest]
    #[case("1", Ok(1))]
    #[case("64 KiB", Ok(65536))]
    #[case("0", Err(()))]
    #[case("0 B", Err(()))]
    #[case("lots", Err(()))]
    fn test_parse_buf_size(#[case] value: &str, #[case] expected: Result<usize, ()>) {
        assert_eq!(parse_buf_size(value).map_err(|_| ()), expected);
    }
}
