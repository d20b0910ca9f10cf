//! Path resolution.
//!
//! Walks a path one component at a time, locking each directory only while
//! its entry is looked up. Absolute paths start at the root inode,
//! relative ones at the caller's working directory. ".." in the root
//! stays in the root, which falls straight out of the on-disk root
//! directory's own ".." entry.

use arrayvec::ArrayVec;

use super::ext2;
use super::inode::{can_read, InodeRef};
use super::stat::is_dir;
use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::param::NAME_MAX;
use crate::proc::Cred;

/// One path component, bounded by NAME_MAX.
pub type Name = ArrayVec<u8, NAME_MAX>;

/// Splits the next component off `path`, skipping slashes.
/// `Ok(None)` when the path is exhausted.
fn next_component(path: &[u8]) -> Result<Option<(Name, &[u8])>> {
    let start = match path.iter().position(|&c| c != b'/') {
        Some(p) => p,
        None => return Ok(None),
    };
    let rest = &path[start..];
    let len = rest.iter().position(|&c| c == b'/').unwrap_or(rest.len());
    if len > NAME_MAX {
        return Err(KernelError::NameTooLong);
    }
    let mut name = Name::new();
    name.try_extend_from_slice(&rest[..len]).unwrap();
    Ok(Some((name, &rest[len..])))
}

/// Resolves `path` to an inode reference.
pub fn name_lookup(path: &[u8], cwd: &InodeRef, cred: &Cred) -> Result<InodeRef> {
    let (ip, _) = walk(path, false, cwd, cred)?;
    Ok(ip)
}

/// Resolves `path` to its parent directory plus the final component.
/// Used by create, link, unlink and friends.
pub fn parent_lookup(path: &[u8], cwd: &InodeRef, cred: &Cred) -> Result<(InodeRef, Name)> {
    let (ip, name) = walk(path, true, cwd, cred)?;
    Ok((ip, name.expect("parent_lookup: no final component")))
}

fn walk(
    path: &[u8],
    parent: bool,
    cwd: &InodeRef,
    cred: &Cred,
) -> Result<(InodeRef, Option<Name>)> {
    let itable = kernel().itable();

    if path.is_empty() {
        return Err(KernelError::NoEnt);
    }

    let mut cur = if path[0] == b'/' {
        itable.root()?
    } else {
        itable.dup(cwd)
    };

    let mut rest = path;
    loop {
        let (name, after) = match next_component(rest) {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                itable.put(cur);
                return Err(e);
            }
        };
        rest = after;

        let mut g = itable.lock(&cur);
        if !is_dir(g.mode) {
            itable.unlock_put(g, cur);
            return Err(KernelError::NotDir);
        }
        if !can_read(&g, cred) {
            itable.unlock_put(g, cur);
            return Err(KernelError::Perm);
        }

        if parent {
            match next_component(rest) {
                Ok(None) => {
                    // Stop one level early and hand the caller the parent.
                    itable.unlock(g);
                    return Ok((cur, Some(name)));
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    itable.unlock_put(g, cur);
                    return Err(e);
                }
            }
        }

        let found = ext2::dir_lookup(kernel().fs().ext2(), &mut g, &name);
        itable.unlock(g);
        match found {
            Ok(Some((ino, _))) => {
                let next = itable.get(cur.dev, ino);
                itable.put(cur);
                cur = next?;
            }
            Ok(None) => {
                itable.put(cur);
                return Err(KernelError::NoEnt);
            }
            Err(e) => {
                itable.put(cur);
                return Err(e);
            }
        }
    }

    if parent {
        // Path named the root or was all slashes; there is no parent
        // component to return.
        itable.put(cur);
        return Err(KernelError::Inval);
    }
    Ok((cur, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comps(path: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = path;
        while let Some((name, after)) = next_component(rest).unwrap() {
            out.push(name.to_vec());
            rest = after;
        }
        out
    }

    #[test]
    fn components_skip_repeated_slashes() {
        assert_eq!(comps(b"/a//bb///c"), vec![b"a".to_vec(), b"bb".to_vec(), b"c".to_vec()]);
        assert_eq!(comps(b"a"), vec![b"a".to_vec()]);
        assert!(comps(b"////").is_empty());
        assert!(comps(b"").is_empty());
    }

    #[test]
    fn dotdot_is_an_ordinary_component() {
        assert_eq!(comps(b"../x"), vec![b"..".to_vec(), b"x".to_vec()]);
    }

    #[test]
    fn overlong_component_is_rejected() {
        let long = [b'a'; NAME_MAX + 1];
        let mut path = Vec::from(&b"/ok/"[..]);
        path.extend_from_slice(&long);
        let mut rest = &path[..];
        // First component parses fine.
        let (first, after) = next_component(rest).unwrap().unwrap();
        assert_eq!(&first[..], b"ok");
        rest = after;
        assert_eq!(next_component(rest).unwrap_err(), KernelError::NameTooLong);
    }
}
