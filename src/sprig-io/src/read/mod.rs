pub mod error;
pub use error::ReadError;

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use genome::{MutKind, Mutation, Position, RefSeq, Sequence};
use log::{debug, info, warn};
use regex::Regex;

/// Name of the reference entry inside a diff file.
pub const REF_NAME: &str = "REF";

/// What the first bytes of an input file announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Fasta,
    Maple,
    Phylip,
    Newick,
    Nexus,
}

/// Sniff the format from the first non-whitespace byte; `>` needs a second
/// look, since both FASTA and MAPLE diff files start with a header line.
pub fn detect_format(path: &Path) -> Result<InputFormat, ReadError> {
    let file = File::open(path).map_err(|err| ReadError::open(path, err))?;
    let mut reader = BufReader::new(file);
    let mut head = String::new();
    reader.read_to_string(&mut head).map_err(|err| ReadError::open(path, err))?;

    let first = head.chars().find(|c| !c.is_whitespace())
        .ok_or_else(|| ReadError::Empty(path.to_path_buf()))?;
    let format = match first {
        '(' | '[' => InputFormat::Newick,
        '#' => InputFormat::Nexus,
        '0'..='9' => InputFormat::Phylip,
        '>' => {
            // A line of the shape `<something> <number>` betrays a
            // mutation list.
            let mutation_line = Regex::new(r"^.+[ \t]\d+$").expect("static regex");
            if head.lines().take(200).any(|line| mutation_line.is_match(line.trim_end())) {
                InputFormat::Maple
            } else {
                InputFormat::Fasta
            }
        }
        other => return Err(ReadError::UnknownFormat { path: path.to_path_buf(), first: other }),
    };
    debug!("Detected {format:?} input at {}", path.display());
    Ok(format)
}

/// Read raw (name, residues) pairs from a FASTA file.
pub fn read_fasta(path: &Path) -> Result<Vec<(String, String)>, ReadError> {
    let file = File::open(path).map_err(|err| ReadError::open(path, err))?;
    let mut sequences: Vec<(String, String)> = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| ReadError::line(path, idx, err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix('>') {
            sequences.push((name.trim().to_string(), String::new()));
        } else {
            let Some(current) = sequences.last_mut() else {
                return Err(ReadError::Malformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: "sequence data before the first '>' header".into(),
                });
            };
            current.1.push_str(trimmed);
        }
    }
    if sequences.is_empty() {
        return Err(ReadError::Empty(path.to_path_buf()));
    }
    info!("Read {} sequences from {}", sequences.len(), path.display());
    Ok(sequences)
}

/// Read raw (name, residues) pairs from a sequential PHYLIP file.
pub fn read_phylip(path: &Path) -> Result<Vec<(String, String)>, ReadError> {
    let file = File::open(path).map_err(|err| ReadError::open(path, err))?;
    let mut lines = BufReader::new(file).lines().enumerate();

    let (_, header) = lines.next().ok_or_else(|| ReadError::Empty(path.to_path_buf()))?;
    let header = header.map_err(|err| ReadError::line(path, 0, err))?;
    let mut fields = header.split_whitespace();
    let ntax: usize = fields.next().and_then(|s| s.parse().ok()).ok_or_else(|| ReadError::Malformed {
        path: path.to_path_buf(),
        line: 1,
        reason: "PHYLIP header must start with the number of taxa".into(),
    })?;
    let nchar: usize = fields.next().and_then(|s| s.parse().ok()).ok_or_else(|| ReadError::Malformed {
        path: path.to_path_buf(),
        line: 1,
        reason: "PHYLIP header must carry the number of characters".into(),
    })?;

    let mut sequences: Vec<(String, String)> = Vec::with_capacity(ntax);
    for (idx, line) in lines {
        let line = line.map_err(|err| ReadError::line(path, idx, err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let unfinished = sequences.last().is_some_and(|(_, seq)| seq.len() < nchar);
        if unfinished {
            let (_, seq) = sequences.last_mut().expect("just checked");
            seq.push_str(&trimmed.replace(char::is_whitespace, ""));
        } else {
            let mut fields = trimmed.split_whitespace();
            let name = fields.next().expect("non-empty line").to_string();
            let rest: String = fields.collect();
            sequences.push((name, rest));
        }
    }

    if sequences.len() != ntax {
        return Err(ReadError::Malformed {
            path: path.to_path_buf(),
            line: 0,
            reason: format!("expected {ntax} taxa, found {}", sequences.len()),
        });
    }
    if let Some((name, seq)) = sequences.iter().find(|(_, seq)| seq.len() != nchar) {
        return Err(ReadError::Malformed {
            path: path.to_path_buf(),
            line: 0,
            reason: format!("sequence '{name}' has {} characters, expected {nchar}", seq.len()),
        });
    }
    info!("Read {} sequences from {}", sequences.len(), path.display());
    Ok(sequences)
}

/// Read the reference genome from a (single-entry) FASTA file.
pub fn read_reference(path: &Path) -> Result<RefSeq, ReadError> {
    let mut entries = read_fasta(path)?;
    if entries.len() > 1 {
        warn!("{} holds {} entries; using the first as the reference", path.display(), entries.len());
    }
    let (_, residues) = entries.swap_remove(0);
    RefSeq::from_str_strict(&residues).map_err(|source| ReadError::Reference { path: path.to_path_buf(), source })
}

/// Column-wise majority consensus over the concrete bases, used as the
/// reference when none was supplied.
pub fn generate_consensus(sequences: &[(String, String)]) -> Result<RefSeq, ReadError> {
    let length = sequences.first().map_or(0, |(_, seq)| seq.len());
    let mut bases = Vec::with_capacity(length);
    for column in 0..length {
        let mut counts = [0usize; genome::ALPHABET_SIZE];
        for (_, seq) in sequences {
            if let Some(c) = seq.chars().nth(column) {
                if let Ok(base) = genome::Base::try_from(c) {
                    counts[base.index()] += 1;
                }
            }
        }
        let (argmax, max) = counts.iter().enumerate().max_by_key(|(_, c)| **c).expect("4 entries");
        if *max == 0 {
            warn!("Alignment column {column} holds no concrete base; defaulting the consensus to A");
        }
        bases.push(genome::Base::from_index(argmax).expect("alphabet index"));
    }
    RefSeq::new(bases).map_err(|source| ReadError::Consensus { source })
}

/// Compare every sequence to the reference and collapse it to its
/// mutation list. Runs of `N` and `-` fold into single entries.
pub fn extract_mutations(
    sequences: &[(String, String)],
    reference: &RefSeq,
) -> Result<Vec<Sequence>, ReadError> {
    let mut result = Vec::with_capacity(sequences.len());
    for (name, residues) in sequences {
        if residues.len() != reference.len() {
            return Err(ReadError::LengthMismatch {
                name: name.clone(),
                length: residues.len(),
                expected: reference.len(),
            });
        }
        let mut mutations: Vec<Mutation> = Vec::new();
        let mut run: Option<(MutKind, Position, Position)> = None;
        for (pos, c) in residues.chars().enumerate() {
            let pos = pos as Position;
            let kind = match c.to_ascii_uppercase() {
                'N' | '?' => Some(MutKind::Missing),
                '-' => Some(MutKind::Deletion),
                _ => {
                    let kind = MutKind::from_char(c).map_err(|_| ReadError::BadResidue {
                        name: name.clone(),
                        position: pos,
                        residue: c,
                    })?;
                    match kind {
                        MutKind::Base(base) if base == reference.base(pos) => None,
                        other => Some(other),
                    }
                }
            };

            match (kind, &mut run) {
                (Some(kind), Some((run_kind, _, len))) if kind == *run_kind && kind.is_run() => {
                    *len += 1;
                }
                (kind, run_slot) => {
                    if let Some((k, p, l)) = run_slot.take() {
                        mutations.push(Mutation::new(k, p, l).expect("runs are built valid"));
                    }
                    if let Some(kind) = kind {
                        if kind.is_run() {
                            *run_slot = Some((kind, pos, 1));
                        } else {
                            mutations.push(Mutation::new(kind, pos, 1).expect("substitutions are single"));
                        }
                    }
                }
            }
        }
        if let Some((k, p, l)) = run {
            mutations.push(Mutation::new(k, p, l).expect("runs are built valid"));
        }
        let sequence = Sequence::new(name.clone(), mutations)
            .map_err(|source| ReadError::Sequence { source })?;
        result.push(sequence);
    }
    Ok(result)
}

/// Read a MAPLE diff file: a `>REF` entry holding the reference, then one
/// `>name` block of tab-separated mutation lines per taxon. Positions are
/// 1-based on disk.
pub fn read_diff(path: &Path, reference_override: Option<&RefSeq>) -> Result<(RefSeq, Vec<Sequence>), ReadError> {
    let file = File::open(path).map_err(|err| ReadError::open(path, err))?;

    let mut reference_text = String::new();
    let mut in_reference = false;
    let mut taxa: Vec<(String, Vec<Mutation>)> = Vec::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| ReadError::line(path, idx, err))?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix('>') {
            let name = name.trim();
            in_reference = name.eq_ignore_ascii_case(REF_NAME);
            if !in_reference {
                taxa.push((name.to_string(), Vec::new()));
            }
            continue;
        }
        if in_reference {
            reference_text.push_str(trimmed.trim());
            continue;
        }

        let Some((_, mutations)) = taxa.last_mut() else {
            return Err(ReadError::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: "mutation line before the first '>' taxon header".into(),
            });
        };
        let mut fields = trimmed.split_whitespace();
        let type_field = fields.next().expect("non-empty line");
        let malformed = |reason: String| ReadError::Malformed { path: path.to_path_buf(), line: idx + 1, reason };
        let mut chars = type_field.chars();
        let (Some(type_char), None) = (chars.next(), chars.next()) else {
            return Err(malformed(format!("mutation type must be one character, got '{type_field}'")));
        };
        let kind = MutKind::from_char(type_char)
            .map_err(|err| malformed(err.to_string()))?;
        let position: Position = fields.next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| malformed("missing or invalid position".into()))?;
        if position == 0 {
            return Err(malformed("positions are 1-based".into()));
        }
        let length: Position = match fields.next() {
            Some(f) => f.parse().map_err(|_| malformed(format!("invalid run length '{f}'")))?,
            None => 1,
        };
        let mutation = Mutation::new(kind, position - 1, length)
            .map_err(|err| malformed(err.to_string()))?;
        mutations.push(mutation);
    }

    let reference = match reference_override {
        Some(reference) => reference.clone(),
        None => {
            if reference_text.is_empty() {
                return Err(ReadError::MissingReference(path.to_path_buf()));
            }
            RefSeq::from_str_strict(&reference_text)
                .map_err(|source| ReadError::Reference { path: path.to_path_buf(), source })?
        }
    };

    let sequences = taxa.into_iter()
        .map(|(name, mutations)| Sequence::new(name, mutations))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ReadError::Sequence { source })?;
    info!("Read {} taxa from {}", sequences.len(), path.display());
    Ok((reference, sequences))
}

/// A parsed Newick node; conversion into the working tree happens at the
/// orchestrator, where the alignment is available.
#[derive(Debug, Clone, PartialEq)]
pub struct NewickNode {
    pub name: Option<String>,
    pub blength: f64,
    pub children: Vec<NewickNode>,
}

/// Recursive-descent Newick parser. Accepts multifurcations and internal
/// labels; ignores comments in square brackets.
pub fn parse_newick(text: &str) -> Result<NewickNode, ReadError> {
    let bytes: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    let mut cursor = 0;
    let node = parse_newick_node(&bytes, &mut cursor)?;
    match bytes.get(cursor) {
        Some(';') => Ok(node),
        other => Err(ReadError::Newick(format!(
            "expected ';' at offset {cursor}, found {other:?}"
        ))),
    }
}

fn parse_newick_node(chars: &[char], cursor: &mut usize) -> Result<NewickNode, ReadError> {
    let mut children = Vec::new();
    if chars.get(*cursor) == Some(&'(') {
        *cursor += 1;
        loop {
            children.push(parse_newick_node(chars, cursor)?);
            match chars.get(*cursor) {
                Some(',') => *cursor += 1,
                Some(')') => {
                    *cursor += 1;
                    break;
                }
                other => {
                    return Err(ReadError::Newick(format!(
                        "expected ',' or ')' at offset {cursor}, found {other:?}"
                    )))
                }
            }
        }
    }

    let mut name = String::new();
    while let Some(&c) = chars.get(*cursor) {
        if matches!(c, ':' | ',' | ')' | ';' | '(') {
            break;
        }
        name.push(c);
        *cursor += 1;
    }

    let mut blength = 0.0;
    if chars.get(*cursor) == Some(&':') {
        *cursor += 1;
        let mut number = String::new();
        while let Some(&c) = chars.get(*cursor) {
            if matches!(c, ',' | ')' | ';') {
                break;
            }
            number.push(c);
            *cursor += 1;
        }
        blength = number.parse().map_err(|_| ReadError::Newick(format!("invalid branch length '{number}'")))?;
    }

    Ok(NewickNode {
        name: (!name.is_empty()).then_some(name),
        blength,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write as _;

    fn temp_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn format_detection_table() -> Result<()> {
        let cases = [
            (">T1\nACGT\n>T2\nACCT\n", InputFormat::Fasta),
            (">REF\nACGT\n>T1\nc\t2\n", InputFormat::Maple),
            ("2 4\nT1 ACGT\nT2 ACCT\n", InputFormat::Phylip),
            ("(T1:0.1,T2:0.1);\n", InputFormat::Newick),
            ("#NEXUS\nbegin data;\n", InputFormat::Nexus),
        ];
        for (content, expected) in cases {
            let file = temp_file(content);
            assert_eq!(detect_format(file.path())?, expected, "content: {content:?}");
        }
        Ok(())
    }

    #[test]
    fn fasta_reader_joins_wrapped_lines() -> Result<()> {
        let file = temp_file(">T1\nACGT\nACGT\n>T2\nAC\nGTACGT\n");
        let sequences = read_fasta(file.path())?;
        assert_eq!(sequences, vec![
            ("T1".to_string(), "ACGTACGT".to_string()),
            ("T2".to_string(), "ACGTACGT".to_string()),
        ]);
        Ok(())
    }

    #[test]
    fn phylip_reader_checks_dimensions() -> Result<()> {
        let file = temp_file("2 8\nT1 ACGTACGT\nT2 ACCTACGT\n");
        let sequences = read_phylip(file.path())?;
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences[1].1, "ACCTACGT");

        let bad = temp_file("3 8\nT1 ACGTACGT\nT2 ACCTACGT\n");
        assert!(read_phylip(bad.path()).is_err());
        Ok(())
    }

    #[test]
    fn mutation_extraction_collapses_runs() -> Result<()> {
        let reference = RefSeq::from_str_strict("AAAAAAAAAA")?;
        let sequences = vec![("T1".to_string(), "ACNNN--AAR".to_string())];
        let extracted = extract_mutations(&sequences, &reference)?;
        let kinds: Vec<_> = extracted[0].mutations().iter()
            .map(|m| (m.kind.to_char(), m.position, m.length))
            .collect();
        assert_eq!(kinds, vec![
            ('c', 1, 1),
            ('n', 2, 3),
            ('-', 5, 2),
            ('r', 9, 1),
        ]);
        Ok(())
    }

    #[test]
    fn diff_reader_roundtrips_positions() -> Result<()> {
        let file = temp_file(">REF\nAAAAAAAAAA\n>T1\nc\t2\nn\t4\t3\n>T2\n-\t1\t2\n");
        let (reference, sequences) = read_diff(file.path(), None)?;
        assert_eq!(reference.len(), 10);
        assert_eq!(sequences.len(), 2);

        let t1: Vec<_> = sequences[0].mutations().iter().map(|m| (m.kind.to_char(), m.position, m.length)).collect();
        assert_eq!(t1, vec![('c', 1, 1), ('n', 3, 3)]);
        let t2: Vec<_> = sequences[1].mutations().iter().map(|m| (m.kind.to_char(), m.position, m.length)).collect();
        assert_eq!(t2, vec![('-', 0, 2)]);
        Ok(())
    }

    #[test]
    fn diff_without_reference_needs_an_override() {
        let file = temp_file(">T1\nc\t2\n");
        assert!(matches!(read_diff(file.path(), None), Err(ReadError::MissingReference(_))));

        let reference = RefSeq::from_str_strict("AAAA").unwrap();
        let (parsed_ref, seqs) = read_diff(file.path(), Some(&reference)).unwrap();
        assert_eq!(parsed_ref, reference);
        assert_eq!(seqs.len(), 1);
    }

    #[test]
    fn consensus_majority() -> Result<()> {
        let sequences = vec![
            ("T1".to_string(), "ACGT".to_string()),
            ("T2".to_string(), "ACCT".to_string()),
            ("T3".to_string(), "ACCA".to_string()),
        ];
        let consensus = generate_consensus(&sequences)?;
        assert_eq!(consensus.to_string(), "ACCT");
        Ok(())
    }

    #[test]
    fn newick_parser_handles_nesting_and_labels() -> Result<()> {
        let tree = parse_newick("((T1:0.1,T2:0.2)0.95:0.05,T3:0.3);")?;
        assert_eq!(tree.children.len(), 2);
        let inner = &tree.children[0];
        assert_eq!(inner.name.as_deref(), Some("0.95"));
        assert_eq!(inner.children[1].name.as_deref(), Some("T2"));
        assert!((inner.children[1].blength - 0.2).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn newick_parser_rejects_garbage() {
        assert!(parse_newick("(T1:0.1,T2").is_err());
        assert!(parse_newick("(T1:abc,T2:1);").is_err());
    }
}
