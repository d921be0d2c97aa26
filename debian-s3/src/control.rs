// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control stanza primitives.

Control stanzas are the `Key: value` blocks used by `.deb` control files,
`Packages` indices, and `Release` files.

Values are stored in their *logical* form: continuation lines are joined
with `\n` and have their leading indentation removed, and the ` .` marker
denoting an empty line becomes an empty line. Serialization folds the
value back into continuation lines.
*/

use {
    crate::error::{DebS3Error, Result},
    std::{
        borrow::Cow,
        io::{BufRead, Write},
    },
};

/// A field in a control stanza.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlField<'a> {
    name: Cow<'a, str>,
    value: Cow<'a, str>,
}

impl<'a> ControlField<'a> {
    /// Construct an instance from a field name and logical value.
    pub fn new(name: Cow<'a, str>, value: Cow<'a, str>) -> Self {
        Self { name, value }
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// The logical value of this field.
    pub fn value_str(&self) -> &str {
        self.value.as_ref()
    }

    /// Obtain an iterator of words in the value.
    pub fn iter_words(&self) -> Box<(dyn Iterator<Item = &str> + '_)> {
        Box::new(self.value.as_ref().split_ascii_whitespace())
    }

    /// Obtain an iterator of lines in the value.
    pub fn iter_lines(&self) -> Box<(dyn Iterator<Item = &str> + '_)> {
        Box::new(self.value.lines())
    }

    /// Write the contents of this field to a writer.
    ///
    /// Multiple line values are folded into continuation lines. Empty lines are
    /// written as ` .`. A value beginning with a newline produces a bare `Name:`
    /// header line.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut lines = self.value.split('\n');

        writer.write_all(self.name.as_bytes())?;
        writer.write_all(b":")?;

        if let Some(first) = lines.next() {
            if !first.is_empty() {
                writer.write_all(b" ")?;
                writer.write_all(first.as_bytes())?;
            }
        }
        writer.write_all(b"\n")?;

        for line in lines {
            if line.is_empty() {
                writer.write_all(b" .\n")?;
            } else {
                writer.write_all(b" ")?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
        }

        Ok(())
    }
}

impl<'a> ToString for ControlField<'a> {
    fn to_string(&self) -> String {
        let mut buf = vec![];
        // Writing to a Vec cannot fail.
        let _ = self.write(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// A stanza in a control file.
///
/// A paragraph is an ordered series of control fields.
///
/// Field names are case insensitive on read and case preserving on set.
/// Paragraphs only contain a single occurrence of a field.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlParagraph<'a> {
    fields: Vec<ControlField<'a>>,
}

impl<'a> ControlParagraph<'a> {
    /// Whether the paragraph is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields in this paragraph.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Set the value of a field via a [ControlField].
    ///
    /// If a field with the same name (case insensitive compare) already exists, its value
    /// is replaced in place, preserving the field's position.
    pub fn set_field(&mut self, field: ControlField<'a>) {
        if let Some(existing) = self
            .fields
            .iter_mut()
            .find(|cf| cf.name.eq_ignore_ascii_case(&field.name))
        {
            *existing = field;
        } else {
            self.fields.push(field);
        }
    }

    /// Set the value of a field defined via strings.
    pub fn set_field_from_string(&mut self, name: Cow<'a, str>, value: Cow<'a, str>) {
        self.set_field(ControlField::new(name, value));
    }

    /// Remove a field, returning it if present.
    pub fn remove_field(&mut self, name: &str) -> Option<ControlField<'a>> {
        let index = self
            .fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))?;

        Some(self.fields.remove(index))
    }

    /// Whether a named field is present in this paragraph.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterate over fields in this paragraph.
    ///
    /// Iteration order is insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField<'a>> {
        self.fields.iter()
    }

    /// Obtain the field with a given name in this paragraph.
    pub fn field(&self, name: &str) -> Option<&'_ ControlField<'a>> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Obtain the raw string value of the named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// Obtain an iterator of words in the named field.
    pub fn field_iter_value_words(
        &self,
        name: &str,
    ) -> Option<Box<(dyn Iterator<Item = &str> + '_)>> {
        self.field(name).map(|f| f.iter_words())
    }

    /// Obtain an iterator of lines in the named field.
    pub fn field_iter_value_lines(
        &self,
        name: &str,
    ) -> Option<Box<(dyn Iterator<Item = &str> + '_)>> {
        self.field(name).map(|f| f.iter_lines())
    }

    /// Serialize the paragraph to a writer.
    ///
    /// A trailing newline is written as part of the final field but no paragraph
    /// separator is emitted.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for field in &self.fields {
            field.write(writer)?;
        }

        Ok(())
    }

    /// Parse a single paragraph from a string.
    ///
    /// Content after the first paragraph is ignored. An input without any fields yields
    /// an empty paragraph.
    pub fn parse_str(s: &str) -> Result<ControlParagraph<'static>> {
        let mut reader = ControlParagraphReader::new(std::io::Cursor::new(s.as_bytes()));

        Ok(reader.next().transpose()?.unwrap_or_default())
    }
}

impl<'a> ToString for ControlParagraph<'a> {
    fn to_string(&self) -> String {
        self.fields.iter().map(|f| f.to_string()).collect()
    }
}

fn is_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c == '-' || c == '_' || c.is_ascii_alphanumeric())
}

/// Holds parsing state for control stanzas.
///
/// Instances are fed lines of text and periodically emit [ControlParagraph] instances
/// as they are completed.
///
/// Parsing is lenient: a `Key:` line starts a new field, an indented line continues
/// the current one, and anything else is ignored.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph<'static>,
    field: Option<(String, String)>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph will be returned.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph<'static>>> {
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');

        // Empty lines signify the end of a paragraph.
        if line.trim().is_empty() {
            self.flush_field();

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        let rest = line.trim_start();
        let indent = line.len() - rest.len();

        if indent > 0 {
            let value = match self.field.as_mut() {
                Some((_, value)) => value,
                None => {
                    return Err(DebS3Error::ControlParse(format!(
                        "continuation line without a field: {}",
                        line
                    )));
                }
            };

            let rest = if indent == 1 && rest == "." {
                value.push('\n');
                ""
            } else {
                if !value.is_empty() {
                    value.push('\n');
                }
                rest
            };
            value.push_str(rest);
        } else if let Some((name, value)) = line.split_once(':') {
            if is_field_name(name) {
                self.flush_field();
                self.field = Some((name.to_string(), value.trim().to_string()));
            }
        }

        Ok(None)
    }

    /// Finish parsing, consuming self.
    ///
    /// If a non-empty paragraph is present in the instance, it will be returned.
    pub fn finish(mut self) -> Result<Option<ControlParagraph<'static>>> {
        self.flush_field();

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self) {
        if let Some((name, value)) = self.field.take() {
            self.paragraph
                .set_field_from_string(Cow::Owned(name), Cow::Owned(value));
        }
    }
}

/// A reader for [ControlParagraph].
///
/// Instances can be consumed as an iterator. Each call into the iterator will attempt to
/// read a full paragraph from the underlying reader.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph<'static>>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        loop {
            let mut line = String::new();

            let bytes_read = self.reader.read_line(&mut line)?;

            if bytes_read != 0 {
                // Keep the parser on errors so iteration can resume at the next line.
                match parser.write_line(&line) {
                    Ok(Some(paragraph)) => {
                        self.parser.replace(parser);
                        return Ok(Some(paragraph));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.parser.replace(parser);
                        return Err(e);
                    }
                }
            } else {
                return parser.finish();
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.parser.is_none() {
            None
        } else {
            match self.get_next() {
                Ok(Some(para)) => Some(Ok(para)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    #[test]
    fn control_paragraph_field_semantics() {
        let mut p = ControlParagraph::default();

        p.set_field_from_string("foo".into(), "bar".into());
        p.set_field_from_string("other".into(), "value".into());
        p.set_field_from_string("foo".into(), "baz".into());
        assert_eq!(p.field_str("foo"), Some("baz"));

        // Different case overwrites and keeps position.
        p.set_field_from_string("FOO".into(), "bar".into());
        assert_eq!(p.field_str("foo"), Some("bar"));
        assert_eq!(p.iter_fields().next().unwrap().name(), "FOO");
        assert_eq!(p.len(), 2);

        assert!(p.remove_field("Other").is_some());
        assert!(!p.has_field("other"));
    }

    #[test]
    fn parse_continuations() -> Result<()> {
        let p = ControlParagraph::parse_str(indoc! {"
            Package: foo
            Description: summary line
             second line
             .
             after blank
            # not a field
            Depends: bar,
              baz
        "})?;

        assert_eq!(p.len(), 3);
        assert_eq!(p.field_str("package"), Some("foo"));
        assert_eq!(
            p.field_str("Description"),
            Some("summary line\nsecond line\n\nafter blank")
        );
        // Only a single space of indentation marks an empty line.
        assert_eq!(p.field_str("Depends"), Some("bar,\nbaz"));

        Ok(())
    }

    #[test]
    fn continuation_without_field_is_error() {
        assert!(ControlParagraph::parse_str(" orphan\n").is_err());
    }

    #[test]
    fn write_folds_values() -> Result<()> {
        let mut p = ControlParagraph::default();
        p.set_field_from_string("Package".into(), "foo".into());
        p.set_field_from_string("Description".into(), "summary\nbody\n\nmore".into());
        p.set_field_from_string("MD5Sum".into(), "\nabc 1 path".into());

        let text = p.to_string();
        assert_eq!(
            text,
            "Package: foo\nDescription: summary\n body\n .\n more\nMD5Sum:\n abc 1 path\n"
        );

        let reparsed = ControlParagraph::parse_str(&text)?;
        assert_eq!(
            reparsed.field_str("Description"),
            Some("summary\nbody\n\nmore")
        );

        Ok(())
    }

    #[test]
    fn reader_multiple_paragraphs() -> Result<()> {
        let paragraphs = ControlParagraphReader::new(std::io::Cursor::new(
            "A: 1\n\n\nB: 2\nC: 3\n\nD: 4".as_bytes(),
        ))
        .collect::<Result<Vec<_>>>()?;

        assert_eq!(paragraphs.len(), 3);
        assert_eq!(paragraphs[1].field_str("C"), Some("3"));
        assert_eq!(paragraphs[2].field_str("D"), Some("4"));

        Ok(())
    }

    #[test]
    fn reader_continues_after_error() -> Result<()> {
        let mut reader =
            ControlParagraphReader::new(std::io::Cursor::new(" stray\nA: 1\n\nB: 2\n".as_bytes()));

        assert!(matches!(
            reader.next(),
            Some(Err(DebS3Error::ControlParse(_)))
        ));

        let rest = reader.collect::<Result<Vec<_>>>()?;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].field_str("A"), Some("1"));
        assert_eq!(rest[1].field_str("B"), Some("2"));

        Ok(())
    }
}
