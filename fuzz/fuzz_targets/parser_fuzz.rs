#![no_main]
use libfuzzer_sys::fuzz_target;

const SUBCOMMANDS: [&str; 4] = ["show", "merge", "full", "index"];
const FLAGS: [&str; 8] = [
    "--max-io-size",
    "--cache-size",
    "--buffer-size",
    "--compression",
    "--level",
    "-o",
    "-b",
    "--json",
];

// First byte picks the subcommand; the rest is split into tokens, each
// prefixed by a flag chosen from its first byte so size and enum parsers see
// fuzzed values.
fuzz_target!(|data: &[u8]| {
    let Some((&pick, rest)) = data.split_first() else {
        return;
    };
    let mut args = vec![SUBCOMMANDS[pick as usize % SUBCOMMANDS.len()].to_string()];
    for token in rest.split(|&b| b == 0).take(16) {
        let Some((&flag, value)) = token.split_first() else {
            continue;
        };
        if flag & 1 == 1 {
            args.push(FLAGS[(flag >> 1) as usize % FLAGS.len()].to_string());
        }
        args.push(String::from_utf8_lossy(value).into_owned());
    }
    wdiff::cli::fuzz_try_parse_args(&args);
});
