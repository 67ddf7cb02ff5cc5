//! Consistency checks between a model, its proposal and the observed data.

use std::collections::BTreeSet;

use itertools::Itertools;

use crate::{
    error::{structure_mismatch, Error, Result},
    plate::{Plate, ProgramNode},
    tensor::NamedTensor,
    tree::{join_path, Tree},
};

/// Fails with the sorted list of names that appear more than once.
pub(crate) fn check_unique(names: &[String]) -> Result<()> {
    let duplicates = names.iter().duplicates().sorted().cloned().collect_vec();
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(Error::NameMismatch { names: duplicates })
    }
}

/// Fails with the sorted names that are in one list but not the other.
pub(crate) fn mismatch_names(p_names: &[String], qdata_names: &[String]) -> Result<()> {
    let p: BTreeSet<&String> = p_names.iter().collect();
    let qdata: BTreeSet<&String> = qdata_names.iter().collect();
    let names = p
        .symmetric_difference(&qdata)
        .map(|name| name.to_string())
        .sorted()
        .collect_vec();
    if names.is_empty() {
        Ok(())
    } else {
        Err(Error::NameMismatch { names })
    }
}

/// Check that Q declares every latent variable of P at the same position,
/// with the same grouping, and nothing else.
///
/// `data` must already be arranged like `p`.
pub(crate) fn check_structure(
    path: &str,
    p: &Plate,
    q: &Plate,
    data: &Tree<NamedTensor>,
) -> Result<()> {
    let empty_plate = Plate::new();
    let empty_data = Tree::new();

    for (name, node) in p.items() {
        match (node, q.get(name)) {
            (ProgramNode::Variable(_), None) if data.value(name).is_some() => {}
            (ProgramNode::Variable(_), Some(_)) if data.value(name).is_some() => {
                return structure_mismatch(
                    path,
                    format!("`{name}` is observed and cannot be declared in Q"),
                );
            }
            (ProgramNode::Variable(_), Some(ProgramNode::Variable(_))) => {}
            (ProgramNode::Group(p_group), Some(ProgramNode::Group(q_group))) => {
                let p_members: BTreeSet<&str> = p_group.names().collect();
                let q_members: BTreeSet<&str> = q_group.names().collect();
                if p_members != q_members {
                    return structure_mismatch(
                        path,
                        format!("group `{name}` has different members in P and Q"),
                    );
                }
            }
            (ProgramNode::Plate(p_inner), q_inner) => {
                let q_inner = match q_inner {
                    Some(ProgramNode::Plate(q_inner)) => q_inner,
                    None => &empty_plate,
                    Some(_) => {
                        return structure_mismatch(
                            path,
                            format!("`{name}` is a plate in P but not in Q"),
                        );
                    }
                };
                let data = data.plate(name).unwrap_or(&empty_data);
                check_structure(&join_path(path, name), p_inner, q_inner, data)?;
            }
            (_, None) => {
                return structure_mismatch(path, format!("`{name}` is not declared in Q"));
            }
            (_, Some(_)) => {
                return structure_mismatch(
                    path,
                    format!("`{name}` is declared with a different kind in P and Q"),
                );
            }
        }
    }

    for (name, _) in q.items() {
        if p.get(name).is_none() {
            return structure_mismatch(path, format!("`{name}` is declared in Q but not in P"));
        }
    }
    Ok(())
}
