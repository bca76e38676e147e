use crate::riffle::common::{Error, Result};
use crate::riffle::proto::connection::Connection;
use crate::riffle::proto::item::Item;

/// One write-side argument, matched positionally against a format directive.
///
/// The directive letters mirror the wire vocabulary: `n` number, `r`
/// revision, `s` string, `c` text, `w` word, `b` boolean. Carrying None in
/// an optional slot omits the item from the output entirely.
#[derive(Clone, Copy, Debug)]
pub enum Arg<'a> {
    Number(u64),
    Revision(Option<u64>),
    String(Option<&'a [u8]>),
    Cstring(Option<&'a str>),
    Word(Option<&'a str>),
    Bool(bool),
}

/// One read-side binding. Optional directives with no matching input bind
/// None; `l` binds the whole sublist unparsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Number(u64),
    Revision(Option<u64>),
    String(Option<Vec<u8>>),
    Cstring(Option<String>),
    Word(Option<String>),
    Bool(bool),
    List(Option<Vec<Item>>),
}

impl Connection {
    /// Emit a tuple described by a format string.
    ///
    /// Directives `n r s c w b` each consume one argument; `(` and `)` open
    /// and close a nested list; `?` makes the following directives optional
    /// (a None argument is then skipped instead of emitted); a leading `!`
    /// suppresses the automatic opening of the outer list and a trailing `!`
    /// suppresses closing it, for incremental construction.
    ///
    /// Panics on a malformed format string or an argument that does not
    /// match its directive; formats are authored in code, not received.
    pub fn write_tuple(&mut self, fmt: &str, args: &[Arg]) -> Result<()> {
        let mut fmt = fmt.as_bytes();
        if fmt.first() == Some(&b'!') {
            fmt = &fmt[1..];
        } else {
            self.start_list()?;
        }

        let mut args = args.iter();
        let mut next_arg = |dir: u8| {
            *args
                .next()
                .unwrap_or_else(|| panic!("missing argument for directive '{}'", dir as char))
        };
        let mut optional = false;
        let mut pos = 0;
        while pos < fmt.len() {
            let dir = fmt[pos];
            match dir {
                b'n' => match next_arg(dir) {
                    Arg::Number(n) => self.write_number(n)?,
                    arg => panic!("directive 'n' got {:?}", arg),
                },
                b'r' => match next_arg(dir) {
                    Arg::Revision(Some(rev)) => self.write_number(rev)?,
                    Arg::Revision(None) => assert!(optional, "required revision is unset"),
                    arg => panic!("directive 'r' got {:?}", arg),
                },
                b's' => match next_arg(dir) {
                    Arg::String(Some(s)) => self.write_string(s)?,
                    Arg::String(None) => assert!(optional, "required string is unset"),
                    arg => panic!("directive 's' got {:?}", arg),
                },
                b'c' => match next_arg(dir) {
                    Arg::Cstring(Some(s)) => self.write_cstring(s)?,
                    Arg::Cstring(None) => assert!(optional, "required string is unset"),
                    arg => panic!("directive 'c' got {:?}", arg),
                },
                b'w' => match next_arg(dir) {
                    Arg::Word(Some(w)) => self.write_word(w)?,
                    Arg::Word(None) => assert!(optional, "required word is unset"),
                    arg => panic!("directive 'w' got {:?}", arg),
                },
                b'b' => match next_arg(dir) {
                    Arg::Bool(b) => self.write_bool(b)?,
                    arg => panic!("directive 'b' got {:?}", arg),
                },
                b'?' => optional = true,
                b'(' => {
                    assert!(!optional, "nested tuples cannot be optional on write");
                    self.start_list()?;
                }
                b')' => {
                    self.end_list()?;
                    optional = false;
                }
                b'!' if pos + 1 == fmt.len() => return Ok(()),
                _ => panic!("unknown format directive '{}'", dir as char),
            }
            pos += 1;
        }
        self.end_list()
    }

    /// Read one item, require it to be a list, and parse it as a tuple.
    pub fn read_tuple(&mut self, fmt: &str) -> Result<Vec<Field>> {
        match self.read_item()? {
            Item::List(list) => parse_tuple(&list, fmt),
            _ => Err(Error::malformed("Malformed network data")),
        }
    }
}

/// Parse a list of items against a format string, producing one Field per
/// value directive. When the list runs out early, remaining directives must
/// be optional and bind None (or the invalid revision).
pub fn parse_tuple(list: &[Item], fmt: &str) -> Result<Vec<Field>> {
    let mut pos = 0;
    let mut fields = Vec::new();
    parse_tuple_at(list, fmt.as_bytes(), &mut pos, &mut fields)?;
    Ok(fields)
}

fn parse_tuple_at(
    list: &[Item],
    fmt: &[u8],
    pos: &mut usize,
    fields: &mut Vec<Field>,
) -> Result<()> {
    let mut optional = false;
    let mut index = 0;
    while *pos < fmt.len() {
        match fmt[*pos] {
            b'?' => {
                optional = true;
                *pos += 1;
                continue;
            }
            b'!' => {
                *pos += 1;
                continue;
            }
            // Closes this nesting level; the caller consumes it.
            b')' => return Ok(()),
            _ => {}
        }
        if index >= list.len() {
            break;
        }

        let elt = &list[index];
        match (fmt[*pos], elt) {
            (b'n', Item::Number(n)) => fields.push(Field::Number(*n)),
            (b'r', Item::Number(n)) => fields.push(Field::Revision(Some(*n))),
            (b's', Item::String(s)) => fields.push(Field::String(Some(s.clone()))),
            (b'c', Item::String(s)) => fields.push(Field::Cstring(Some(
                String::from_utf8(s.clone())
                    .map_err(|_| Error::malformed("Malformed network data"))?,
            ))),
            (b'w', Item::Word(w)) => fields.push(Field::Word(Some(w.clone()))),
            (b'b', Item::Word(w)) => {
                if w == "true" {
                    fields.push(Field::Bool(true));
                } else if w == "false" {
                    fields.push(Field::Bool(false));
                } else if optional {
                    // Not a boolean: the optional tail ends here.
                    break;
                } else {
                    return Err(Error::malformed("Malformed network data"));
                }
            }
            (b'l', Item::List(l)) => fields.push(Field::List(Some(l.clone()))),
            (b'(', Item::List(l)) => {
                *pos += 1;
                parse_tuple_at(l, fmt, pos, fields)?;
                // parse_tuple_at returned at the matching ')', consumed below.
            }
            _ => return Err(Error::malformed("Malformed network data")),
        }
        *pos += 1;
        index += 1;
    }

    // Input exhausted; bind sentinels for the remaining optional directives.
    let mut depth = 0i32;
    while *pos < fmt.len() {
        match fmt[*pos] {
            b'?' => optional = true,
            b'!' => {}
            b'(' => {
                if !optional {
                    return Err(Error::malformed("Malformed network data"));
                }
                depth += 1;
            }
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return Ok(());
                }
            }
            dir => {
                if !optional {
                    return Err(Error::malformed("Malformed network data"));
                }
                match dir {
                    b'r' => fields.push(Field::Revision(None)),
                    b's' => fields.push(Field::String(None)),
                    b'c' => fields.push(Field::Cstring(None)),
                    b'w' => fields.push(Field::Word(None)),
                    b'l' => fields.push(Field::List(None)),
                    // Numbers and booleans have no absent form; they stop
                    // binding here.
                    _ => {}
                }
            }
        }
        *pos += 1;
    }
    Ok(())
}
