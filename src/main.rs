use std::io::{self, Write};
use std::process;

use anyhow::Context;
use clap::{arg, command, ArgAction, ArgMatches, Command};
use log::info;

use regex_backtrack::{Automaton, CaptureTable, RegexBuilder};

fn cli() -> Command {
    command!()
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("dot")
                .about("Output DOT (Graphviz) representation of the automaton")
                .arg(arg!(<PATTERN> "Regular expression"))
                .args(syntax_flags()),
        )
        .subcommand(
            Command::new("match")
                .about("Match pattern against one or more inputs")
                .arg(arg!(<PATTERN> "Regular expression"))
                .arg(arg!(<INPUT> ... "Inputs to match").action(ArgAction::Append))
                .args(syntax_flags())
                .arg(arg!(--anchored "Only try a match at the start of each input"))
                .arg(arg!(--debug "Print the compiled automaton before matching")),
        )
}

fn syntax_flags() -> [clap::Arg; 3] {
    [
        arg!(-i --"case-insensitive" "Match letters regardless of case"),
        arg!(-m --"multi-line" "Make ^ and $ match at line boundaries"),
        arg!(-s --"dot-all" "Make . match new lines"),
    ]
}

fn compile(args: &ArgMatches) -> anyhow::Result<Automaton> {
    let pattern = args
        .get_one::<String>("PATTERN")
        .context("missing pattern")?;
    let automaton = RegexBuilder::new()
        .case_insensitive(args.get_flag("case-insensitive"))
        .multi_line(args.get_flag("multi-line"))
        .dot_matches_new_line(args.get_flag("dot-all"))
        .parse(pattern)
        .with_context(|| format!("failed to compile pattern {:?}", pattern))?;
    info!("compiled {:?} into {} states", pattern, automaton.states().len());
    Ok(automaton)
}

fn run_dot(args: &ArgMatches) -> anyhow::Result<()> {
    let automaton = compile(args)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    automaton.to_dot(&mut out)?;
    out.flush()?;
    Ok(())
}

fn groups(table: &CaptureTable) -> String {
    table
        .iter()
        .enumerate()
        .map(|(group, span)| match span {
            Some(span) => format!("{}={}", group, span),
            None => format!("{}=-", group),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn run_match(args: &ArgMatches) -> anyhow::Result<()> {
    let automaton = compile(args)?;
    let anchored = args.get_flag("anchored");

    if let Some(pattern) = args.get_one::<String>("PATTERN") {
        eprintln!("pattern: {pattern}");
    }
    eprintln!("memory_size: {} bytes", automaton.memory_size());
    if args.get_flag("debug") {
        eprintln!("{:#?}", automaton);
    }
    eprintln!();

    let mut any_failed = false;
    for input in args.get_many::<String>("INPUT").into_iter().flatten() {
        let bytes = input.as_bytes();
        let found = if anchored {
            automaton.match_at(bytes, 0)
        } else {
            automaton.find_first(bytes)
        };

        match found {
            Some(table) => {
                println!("  \x1b[32mMATCH\x1b[0m  {:?}  {}", input, groups(&table));
            }
            None => {
                println!("  \x1b[31mNO MATCH\x1b[0m  {:?}", input);
                any_failed = true;
            }
        }
    }

    if any_failed {
        process::exit(1);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = cli().get_matches();
    match args.subcommand() {
        Some(("dot", args)) => run_dot(args),
        Some(("match", args)) => run_match(args),
        _ => unreachable!(),
    }
}
