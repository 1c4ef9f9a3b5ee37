use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{digit1, multispace0, multispace1},
    combinator::{all_consuming, map_res},
    sequence::{delimited, preceded},
    IResult,
};
use thiserror::Error;

use crate::model::InputPair;

/// Message shown on the form for any rejected submission.
pub const FORM_ERROR: &str = "Please enter a valid height and/or weight";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be a positive whole number")]
    NotANumber { field: &'static str },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Calc { weight: u32, height: u32 },
    Show { id: u64 },
    Help,
    Exit,
}

// --- BASIC PARSERS ---

fn parse_u32(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(input)
}

fn parse_u64(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

// --- FIELD VALIDATION ---

/// Parses one raw form field. Only ASCII digits are accepted, with no sign
/// or surrounding whitespace; leading zeros are allowed and do not change
/// the value.
pub fn parse_measurement(field: &'static str, raw: &str) -> Result<u32, ValidationError> {
    match all_consuming(parse_u32)(raw) {
        Ok((_, 0)) => Err(ValidationError::Zero { field }),
        Ok((_, value)) => Ok(value),
        Err(_) => Err(ValidationError::NotANumber { field }),
    }
}

pub fn parse_input_pair(weight: &str, height: &str) -> Result<InputPair, ValidationError> {
    let weight = parse_measurement("weight", weight)?;
    let height = parse_measurement("height", height)?;
    InputPair::new(weight, height).ok_or(ValidationError::Zero { field: "height" })
}

/// Record id from a URL segment. Anything but a positive integer is `None`.
pub fn parse_record_id(raw: &str) -> Option<u64> {
    match all_consuming(parse_u64)(raw) {
        Ok((_, id)) if id > 0 => Some(id),
        _ => None,
    }
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

// --- COMMAND PARSERS ---

fn parse_calc(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("CALC"), tag_ci("BMI")))(input)?;
    let (input, weight) = preceded(multispace1, parse_u32)(input)?;
    let (input, height) = preceded(multispace1, parse_u32)(input)?;
    Ok((input, Command::Calc { weight, height }))
}

fn parse_show(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("SHOW"), tag_ci("GET")))(input)?;
    let (input, id) = preceded(multispace1, parse_u64)(input)?;
    Ok((input, Command::Show { id }))
}

fn parse_help(input: &str) -> IResult<&str, Command> {
    let (input, _) = ws(tag_ci("HELP"))(input)?;
    Ok((input, Command::Help))
}

fn parse_exit(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("EXIT"), tag_ci("QUIT")))(input)?;
    Ok((input, Command::Exit))
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((parse_calc, parse_show, parse_help, parse_exit))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(20).collect();
            if context.len() < e.input.len() {
                Err(format!("Invalid syntax near: '{}...'", context))
            } else {
                Err(format!("Invalid syntax near: '{}'", context))
            }
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}
