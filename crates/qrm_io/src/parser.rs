//! Parser for workload scripts.
//!
//! A script holds one instruction per line. Blank lines and lines starting
//! with `#` are skipped, and a `#` after an instruction starts a trailing
//! comment. Arguments are separated by spaces or tabs:
//!
//! ```text
//! alloc q0 5 ecc,shared   # slot, qubits, optional flag list
//! inject q0 x 1
//! correct q0
//! encode "hello"          # or encode 0x68656c6c6f
//! control x 2 0x01
//! decode 5
//! release q0
//! ```

use anyhow::{Context, Result, anyhow};
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, tag_no_case};
use nom::character::complete::{
    alpha1, alphanumeric1, char, digit1, hex_digit1, space0, space1,
};
use nom::combinator::{all_consuming, map, map_opt, map_res, opt, recognize, rest};
use nom::error::{Error, ErrorKind};
use nom::multi::{many0_count, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::{Finish, IResult};
use qrm_common::{BlockFlags, Gate};
use qrm_core::vm::Instruction;
use std::fs;
use std::path::Path;

type PResult<'a, T> = IResult<&'a str, T>;

/// Separator followed by one argument.
fn arg<'a, O>(
    parser: impl FnMut(&'a str) -> PResult<'a, O>,
) -> impl FnMut(&'a str) -> PResult<'a, O> {
    preceded(space1, parser)
}

fn slot(input: &str) -> PResult<'_, String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0_count(alt((alphanumeric1, tag("_")))),
        )),
        String::from,
    )(input)
}

fn count(input: &str) -> PResult<'_, usize> {
    map_res(digit1, str::parse::<usize>)(input)
}

/// Decimal or `0x` hexadecimal.
fn value(input: &str) -> PResult<'_, u64> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |h| {
            u64::from_str_radix(h, 16)
        }),
        map_res(digit1, str::parse::<u64>),
    ))(input)
}

fn gate(input: &str) -> PResult<'_, Gate> {
    map_opt(alphanumeric1, Gate::from_mnemonic)(input)
}

fn flags(input: &str) -> PResult<'_, BlockFlags> {
    map(
        separated_list1(char(','), map_opt(alpha1, BlockFlags::from_name)),
        |list| list.into_iter().fold(BlockFlags::NONE, BlockFlags::union),
    )(input)
}

fn hex_bytes(input: &str) -> PResult<'_, Vec<u8>> {
    map_res(preceded(tag_no_case("0x"), hex_digit1), |h: &str| {
        if h.len() % 2 != 0 {
            return Err(ErrorKind::HexDigit);
        }
        (0..h.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&h[i..i + 2], 16).map_err(|_| ErrorKind::HexDigit))
            .collect()
    })(input)
}

fn quoted(input: &str) -> PResult<'_, Vec<u8>> {
    map(
        delimited(char('"'), opt(is_not("\"")), char('"')),
        |s: Option<&str>| s.unwrap_or_default().as_bytes().to_vec(),
    )(input)
}

/// Quoted text or `0x` hex bytes.
fn data(input: &str) -> PResult<'_, Vec<u8>> {
    alt((quoted, hex_bytes))(input)
}

fn instruction(start: &str) -> PResult<'_, Instruction> {
    let (input, keyword) = alpha1(start)?;
    match keyword {
        "alloc" => map(
            tuple((arg(slot), arg(count), opt(arg(flags)))),
            |(slot, qubits, flags)| Instruction::Alloc {
                slot,
                qubits,
                flags: flags.unwrap_or(BlockFlags::NONE),
            },
        )(input),
        "acquire" => map(arg(slot), |slot| Instruction::Acquire { slot })(input),
        "release" => map(arg(slot), |slot| Instruction::Release { slot })(input),
        "init" => map(pair(arg(slot), arg(value)), |(slot, value)| {
            Instruction::Init { slot, value }
        })(input),
        "gate" => map(
            tuple((arg(slot), arg(gate), arg(count))),
            |(slot, gate, qubit)| Instruction::Gate { slot, gate, qubit },
        )(input),
        "entangle" => map(pair(arg(slot), arg(slot)), |(a, b)| Instruction::Entangle {
            a,
            b,
        })(input),
        "inject" => map(
            tuple((arg(slot), arg(gate), arg(count))),
            |(slot, gate, qubit)| Instruction::Inject { slot, gate, qubit },
        )(input),
        "correct" => map(arg(slot), |slot| Instruction::Correct { slot })(input),
        "encode" => map(arg(data), |data| Instruction::Encode { data })(input),
        "decode" => map(arg(count), |len| Instruction::Decode { len })(input),
        "control" => map(
            tuple((arg(gate), arg(count), arg(data))),
            |(gate, qubit, data)| Instruction::Control { gate, qubit, data },
        )(input),
        "setmax" => map(arg(count), |qubits| Instruction::SetMax { qubits })(input),
        "stats" => Ok((input, Instruction::Stats)),
        _ => Err(nom::Err::Error(Error::new(start, ErrorKind::Tag))),
    }
}

/// One non-blank line: an instruction, optional trailing comment, nothing else.
fn line(input: &str) -> PResult<'_, Instruction> {
    all_consuming(delimited(
        space0,
        instruction,
        terminated(space0, opt(pair(char('#'), rest))),
    ))(input)
}

/// Parses a single script line.
///
/// # Returns
///
/// `None` for blank and comment-only lines, otherwise the instruction or an
/// error naming the column where parsing stopped.
pub fn parse_line(text: &str) -> Result<Option<Instruction>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    match line(text).finish() {
        Ok((_, instr)) => Ok(Some(instr)),
        Err(e) => {
            let column = text.len() - e.input.len() + 1;
            let near: String = e.input.chars().take(16).collect();
            Err(anyhow!(
                "column {column}: unexpected `{near}` ({:?})",
                e.code
            ))
        }
    }
}

/// Parses a whole script.
///
/// # Arguments
///
/// * `source` - Script text
///
/// # Returns
///
/// The instructions in order, or the first syntax error tagged with its
/// 1-based line number.
pub fn parse_script(source: &str) -> Result<Vec<Instruction>> {
    let mut program = Vec::new();
    for (index, text) in source.lines().enumerate() {
        if let Some(instr) = parse_line(text).with_context(|| format!("line {}", index + 1))? {
            program.push(instr);
        }
    }
    Ok(program)
}

/// Reads and parses a script file.
pub fn load_script_file<P: AsRef<Path>>(path: P) -> Result<Vec<Instruction>> {
    let path = path.as_ref();
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to open script {}", path.display()))?;
    parse_script(&source).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_instruction() {
        let program = parse_script(
            "# workload\n\
             alloc q0 5 ecc,shared\n\
             alloc anc 3\n\
             acquire q0\n\
             init q0 0x1f\n\
             gate q0 h 2\n\
             entangle q0 anc\n\
             inject q0 x 1   # bit flip\n\
             correct q0\n\
             encode \"hi there\"\n\
             encode 0x00ff\n\
             decode 4\n\
             control phase 3 \"1\"\n\
             setmax 512\n\
             \n\
             stats\n\
             release q0\n",
        )
        .unwrap();

        assert_eq!(program.len(), 15);
        assert_eq!(
            program[0],
            Instruction::Alloc {
                slot: "q0".into(),
                qubits: 5,
                flags: BlockFlags::ERROR_CORRECTABLE | BlockFlags::SHARED,
            }
        );
        assert_eq!(
            program[1],
            Instruction::Alloc {
                slot: "anc".into(),
                qubits: 3,
                flags: BlockFlags::NONE,
            }
        );
        assert_eq!(
            program[3],
            Instruction::Init {
                slot: "q0".into(),
                value: 0x1f
            }
        );
        assert_eq!(
            program[6],
            Instruction::Inject {
                slot: "q0".into(),
                gate: Gate::X,
                qubit: 1
            }
        );
        assert_eq!(
            program[8],
            Instruction::Encode {
                data: b"hi there".to_vec()
            }
        );
        assert_eq!(
            program[9],
            Instruction::Encode {
                data: vec![0x00, 0xff]
            }
        );
        assert_eq!(
            program[11],
            Instruction::Control {
                gate: Gate::Phase,
                qubit: 3,
                data: b"1".to_vec()
            }
        );
        assert_eq!(program[13], Instruction::Stats);
    }

    #[test]
    fn errors_carry_the_line_number() {
        let err = parse_script("alloc a 3\nalloc b\nstats\n").unwrap_err();
        assert!(format!("{err:#}").starts_with("line 2"), "{err:#}");

        let err = parse_script("\n\nfrobnicate a\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 3"));
    }

    #[test]
    fn rejects_malformed_arguments() {
        for bad in [
            "alloc a 3 bogusflag",
            "gate a cz 0",
            "encode 0xabc",
            "encode \"unterminated",
            "decode -1",
            "stats extra",
            "correct 1slot",
        ] {
            assert!(parse_line(bad).is_err(), "accepted `{bad}`");
        }
    }

    #[test]
    fn display_output_parses_back() {
        let program = vec![
            Instruction::Alloc {
                slot: "b_1".into(),
                qubits: 64,
                flags: BlockFlags::ENTANGLED | BlockFlags::PERSISTENT,
            },
            Instruction::Control {
                gate: Gate::Y,
                qubit: 0,
                data: vec![b'"', 0],
            },
            Instruction::Encode {
                data: b"plain".to_vec(),
            },
        ];
        for instr in program {
            assert_eq!(parse_line(&instr.to_string()).unwrap(), Some(instr));
        }
    }

    #[test]
    fn comment_and_blank_lines_are_skipped() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("  # note").unwrap(), None);
        assert_eq!(parse_line("\tstats\t").unwrap(), Some(Instruction::Stats));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.qrm");
        std::fs::write(&path, "alloc a 2\nrelease a\n").unwrap();
        assert_eq!(load_script_file(&path).unwrap().len(), 2);
        assert!(load_script_file(dir.path().join("missing.qrm")).is_err());
    }
}
