//! # Parser Combinators
//!
//! Building blocks for the token-level parsers in [`super::parsers`].
//!
//! * **Primitive**: [`Satisfy`]
//! * **Sequential**: [`Preceded`], [`Terminated`], [`Delimited`], [`Tuple2`], [`Tuple3`], [`Tuple4`]
//! * **Alternative**: [`Choice`], [`Optional`]
//! * **Repetition**: [`SeparatedList`], [`Many1`]
//! * **Transformation**: [`Map`], [`AsUnit`]
//! * **Error handling**: [`WithContext`]

use super::core::{ParseError, ParseResult, Parser};
use std::fmt;
use std::marker::PhantomData;

/// Consumes one item when `f` accepts it.
#[derive(Clone)]
pub struct Satisfy<I, O, F> {
    f: F,
    expected: String,
    _phantom: PhantomData<(I, O)>,
}

impl<I, O, F> Satisfy<I, O, F> {
    pub fn new(f: F, expected: &str) -> Self {
        Self {
            f,
            expected: expected.to_string(),
            _phantom: PhantomData,
        }
    }
}

impl<I, O, F> Parser<I, O> for Satisfy<I, O, F>
where
    I: fmt::Display,
    F: Fn(&I) -> Option<O>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O> {
        match input.get(pos) {
            Some(item) => match (self.f)(item) {
                Some(value) => Ok((pos + 1, value)),
                None => Err(ParseError::unexpected(
                    self.expected.clone(),
                    item.to_string(),
                    pos,
                )),
            },
            None => Err(ParseError::eof(self.expected.clone(), pos)),
        }
    }
}

/// Tries each parser in order and returns the first success.
pub struct Choice<I, O> {
    parsers: Vec<Box<dyn Parser<I, O>>>,
}

impl<I, O> Choice<I, O> {
    pub fn new(parsers: Vec<Box<dyn Parser<I, O>>>) -> Self {
        Self { parsers }
    }
}

impl<I, O> Parser<I, O> for Choice<I, O> {
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O> {
        for parser in &self.parsers {
            if let Ok(result) = parser.parse(input, pos) {
                return Ok(result);
            }
        }
        Err(ParseError::NoAlternative {
            position: pos,
            context: None,
        })
    }
}

/// Transforms the output of a parser.
#[derive(Clone)]
pub struct Map<P, F, A, B> {
    parser: P,
    f: F,
    _phantom: PhantomData<(A, B)>,
}

impl<P, F, A, B> Map<P, F, A, B> {
    pub fn new(parser: P, f: F) -> Self {
        Self {
            parser,
            f,
            _phantom: PhantomData,
        }
    }
}

impl<I, A, B, P, F> Parser<I, B> for Map<P, F, A, B>
where
    P: Parser<I, A>,
    F: Fn(A) -> B,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<B> {
        self.parser
            .parse(input, pos)
            .map(|(pos, value)| (pos, (self.f)(value)))
    }
}

/// Discards the output of a parser.
#[derive(Clone)]
pub struct AsUnit<P, O> {
    parser: P,
    _phantom: PhantomData<O>,
}

impl<P, O> AsUnit<P, O> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            _phantom: PhantomData,
        }
    }
}

impl<I, P, O> Parser<I, ()> for AsUnit<P, O>
where
    P: Parser<I, O>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<()> {
        self.parser.parse(input, pos).map(|(pos, _)| (pos, ()))
    }
}

/// One or more items separated by `separator`.
#[derive(Clone)]
pub struct SeparatedList<P, S, I, O> {
    item: P,
    separator: S,
    _phantom: PhantomData<(I, O)>,
}

impl<P, S, I, O> SeparatedList<P, S, I, O> {
    pub fn new(item: P, separator: S) -> Self {
        Self {
            item,
            separator,
            _phantom: PhantomData,
        }
    }
}

impl<I, O, P, S> Parser<I, Vec<O>> for SeparatedList<P, S, I, O>
where
    P: Parser<I, O>,
    S: Parser<I, ()>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<Vec<O>> {
        let (mut current_pos, first) = self.item.parse(input, pos)?;
        let mut results = vec![first];
        while let Ok((after_sep, _)) = self.separator.parse(input, current_pos) {
            let (next_pos, value) = self.item.parse(input, after_sep)?;
            results.push(value);
            current_pos = next_pos;
        }
        Ok((current_pos, results))
    }
}

/// One or more repetitions of `parser`.
#[derive(Clone)]
pub struct Many1<P, I, O> {
    parser: P,
    _phantom: PhantomData<(I, O)>,
}

impl<P, I, O> Many1<P, I, O> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            _phantom: PhantomData,
        }
    }
}

impl<I, O, P> Parser<I, Vec<O>> for Many1<P, I, O>
where
    P: Parser<I, O>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<Vec<O>> {
        let (mut current_pos, first) = self.parser.parse(input, pos)?;
        let mut results = vec![first];
        while let Ok((next_pos, value)) = self.parser.parse(input, current_pos) {
            results.push(value);
            current_pos = next_pos;
        }
        Ok((current_pos, results))
    }
}

/// Succeeds with `None` when the inner parser fails.
#[derive(Clone)]
pub struct Optional<P, I, O> {
    parser: P,
    _phantom: PhantomData<(I, O)>,
}

impl<P, I, O> Optional<P, I, O> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            _phantom: PhantomData,
        }
    }
}

impl<I, O, P> Parser<I, Option<O>> for Optional<P, I, O>
where
    P: Parser<I, O>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<Option<O>> {
        match self.parser.parse(input, pos) {
            Ok((pos, value)) => Ok((pos, Some(value))),
            Err(_) => Ok((pos, None)),
        }
    }
}

/// Runs `first` then `second`, keeping the second result.
#[derive(Clone)]
pub struct Preceded<P1, P2, I, O> {
    first: P1,
    second: P2,
    _phantom: PhantomData<(I, O)>,
}

impl<P1, P2, I, O> Preceded<P1, P2, I, O> {
    pub fn new(first: P1, second: P2) -> Self {
        Self {
            first,
            second,
            _phantom: PhantomData,
        }
    }
}

impl<P1, P2, I, O> Parser<I, O> for Preceded<P1, P2, I, O>
where
    P1: Parser<I, ()>,
    P2: Parser<I, O>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O> {
        let (pos, _) = self.first.parse(input, pos)?;
        self.second.parse(input, pos)
    }
}

/// Runs `first` then `second`, keeping the first result.
#[derive(Clone)]
pub struct Terminated<P1, P2, I, O> {
    first: P1,
    second: P2,
    _phantom: PhantomData<(I, O)>,
}

impl<P1, P2, I, O> Terminated<P1, P2, I, O> {
    pub fn new(first: P1, second: P2) -> Self {
        Self {
            first,
            second,
            _phantom: PhantomData,
        }
    }
}

impl<P1, P2, I, O> Parser<I, O> for Terminated<P1, P2, I, O>
where
    P1: Parser<I, O>,
    P2: Parser<I, ()>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O> {
        let (pos, value) = self.first.parse(input, pos)?;
        let (pos, _) = self.second.parse(input, pos)?;
        Ok((pos, value))
    }
}

/// `left parser right`, keeping the middle result.
#[derive(Clone)]
pub struct Delimited<L, P, R, I, O> {
    left: L,
    parser: P,
    right: R,
    _phantom: PhantomData<(I, O)>,
}

impl<L, P, R, I, O> Delimited<L, P, R, I, O> {
    pub fn new(left: L, parser: P, right: R) -> Self {
        Self {
            left,
            parser,
            right,
            _phantom: PhantomData,
        }
    }
}

impl<I, O, L, P, R> Parser<I, O> for Delimited<L, P, R, I, O>
where
    L: Parser<I, ()>,
    P: Parser<I, O>,
    R: Parser<I, ()>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O> {
        let (pos, _) = self.left.parse(input, pos)?;
        let (pos, value) = self.parser.parse(input, pos)?;
        let (pos, _) = self.right.parse(input, pos)?;
        Ok((pos, value))
    }
}

#[derive(Clone)]
pub struct Tuple2<P1, P2, I, O1, O2> {
    p1: P1,
    p2: P2,
    _phantom: PhantomData<(I, O1, O2)>,
}

impl<P1, P2, I, O1, O2> Tuple2<P1, P2, I, O1, O2> {
    pub fn new(p1: P1, p2: P2) -> Self {
        Self {
            p1,
            p2,
            _phantom: PhantomData,
        }
    }
}

impl<P1, P2, I, O1, O2> Parser<I, (O1, O2)> for Tuple2<P1, P2, I, O1, O2>
where
    P1: Parser<I, O1>,
    P2: Parser<I, O2>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<(O1, O2)> {
        let (pos, o1) = self.p1.parse(input, pos)?;
        let (pos, o2) = self.p2.parse(input, pos)?;
        Ok((pos, (o1, o2)))
    }
}

#[derive(Clone)]
pub struct Tuple3<P1, P2, P3, I, O1, O2, O3> {
    p1: P1,
    p2: P2,
    p3: P3,
    _phantom: PhantomData<(I, O1, O2, O3)>,
}

impl<P1, P2, P3, I, O1, O2, O3> Tuple3<P1, P2, P3, I, O1, O2, O3> {
    pub fn new(p1: P1, p2: P2, p3: P3) -> Self {
        Self {
            p1,
            p2,
            p3,
            _phantom: PhantomData,
        }
    }
}

impl<P1, P2, P3, I, O1, O2, O3> Parser<I, (O1, O2, O3)> for Tuple3<P1, P2, P3, I, O1, O2, O3>
where
    P1: Parser<I, O1>,
    P2: Parser<I, O2>,
    P3: Parser<I, O3>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<(O1, O2, O3)> {
        let (pos, o1) = self.p1.parse(input, pos)?;
        let (pos, o2) = self.p2.parse(input, pos)?;
        let (pos, o3) = self.p3.parse(input, pos)?;
        Ok((pos, (o1, o2, o3)))
    }
}

#[derive(Clone)]
pub struct Tuple4<P1, P2, P3, P4, I, O1, O2, O3, O4> {
    p1: P1,
    p2: P2,
    p3: P3,
    p4: P4,
    _phantom: PhantomData<(I, O1, O2, O3, O4)>,
}

impl<P1, P2, P3, P4, I, O1, O2, O3, O4> Tuple4<P1, P2, P3, P4, I, O1, O2, O3, O4> {
    pub fn new(p1: P1, p2: P2, p3: P3, p4: P4) -> Self {
        Self {
            p1,
            p2,
            p3,
            p4,
            _phantom: PhantomData,
        }
    }
}

impl<P1, P2, P3, P4, I, O1, O2, O3, O4> Parser<I, (O1, O2, O3, O4)>
    for Tuple4<P1, P2, P3, P4, I, O1, O2, O3, O4>
where
    P1: Parser<I, O1>,
    P2: Parser<I, O2>,
    P3: Parser<I, O3>,
    P4: Parser<I, O4>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<(O1, O2, O3, O4)> {
        let (pos, o1) = self.p1.parse(input, pos)?;
        let (pos, o2) = self.p2.parse(input, pos)?;
        let (pos, o3) = self.p3.parse(input, pos)?;
        let (pos, o4) = self.p4.parse(input, pos)?;
        Ok((pos, (o1, o2, o3, o4)))
    }
}

/// Adds a context label to any error from the inner parser.
#[derive(Clone)]
pub struct WithContext<P, C> {
    parser: P,
    context: C,
}

impl<P, C> WithContext<P, C> {
    pub fn new(parser: P, context: C) -> Self {
        Self { parser, context }
    }
}

impl<I, O, P, C: ToString> Parser<I, O> for WithContext<P, C>
where
    P: Parser<I, O>,
{
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O> {
        self.parser
            .parse(input, pos)
            .map_err(|e| e.with_context(&self.context.to_string()))
    }
}
