//! Lowest common ancestor search
//!
//! Walks one or two id-partitioned DAG views backwards in insertion order,
//! keeping a frontier per side. A version joining both sides' visited sets
//! is a candidate ancestor; parents of candidates are covered and can no
//! longer be lowest. The walk stops when one frontier is a subset of the
//! other, at which point the remaining shared frontier is itself made of
//! common ancestors.

use std::collections::HashSet;

use thiserror::Error;

use vantage_model::{Item, Version};
use vantage_tree::TreeError;

use crate::overlay::DagSource;

/// Errors from LCA search.
#[derive(Debug, Error)]
pub enum LcaError {
    #[error("no common ancestor")]
    NoLca,

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

struct Walk {
    fx: HashSet<Version>,
    fy: HashSet<Version>,
    ax: HashSet<Version>,
    ay: HashSet<Version>,
    covered: HashSet<Version>,
    candidates: Vec<Version>,
}

impl Walk {
    fn new(x: &Item, y: &Item) -> Self {
        Self {
            fx: seed(x),
            fy: seed(y),
            ax: HashSet::new(),
            ay: HashSet::new(),
            covered: HashSet::new(),
            candidates: Vec::new(),
        }
    }

    fn visit(&mut self, item: &Item, x_side: bool, y_side: bool) {
        let Some(v) = &item.h.v else { return };

        if x_side && self.fx.remove(v) {
            self.ax.insert(v.clone());
            self.fx.extend(item.h.pa.iter().cloned());
        }
        if y_side && self.fy.remove(v) {
            self.ay.insert(v.clone());
            self.fy.extend(item.h.pa.iter().cloned());
        }

        if self.covered.contains(v) {
            // Anything above a covered version is covered too.
            self.covered.extend(item.h.pa.iter().cloned());
        } else if self.ax.contains(v) && self.ay.contains(v) && !self.candidates.contains(v) {
            self.candidates.push(v.clone());
            self.covered.extend(item.h.pa.iter().cloned());
        }
    }

    /// Subset termination; on the way out the shared frontier is finalized.
    fn finished(&mut self) -> bool {
        if self.fx.is_empty() && self.fy.is_empty() {
            return true;
        }
        // An empty frontier is not a subset here: the other stream may still
        // have to visit versions that complete a candidate.
        let sub = if !self.fx.is_empty() && self.fx.is_subset(&self.fy) {
            &self.fx
        } else if !self.fy.is_empty() && self.fy.is_subset(&self.fx) {
            &self.fy
        } else {
            return false;
        };
        for v in sub {
            if !self.covered.contains(v) && !self.candidates.contains(v) {
                self.candidates.push(v.clone());
            }
        }
        true
    }

    fn into_result(self) -> Result<Vec<Version>, LcaError> {
        let covered = self.covered;
        let out: Vec<Version> = self
            .candidates
            .into_iter()
            .filter(|v| !covered.contains(v))
            .collect();
        if out.is_empty() {
            Err(LcaError::NoLca)
        } else {
            Ok(out)
        }
    }
}

fn seed(item: &Item) -> HashSet<Version> {
    // A virtual merge has no version of its own; its parents stand in.
    match &item.h.v {
        Some(v) => std::iter::once(v.clone()).collect(),
        None => item.h.pa.iter().cloned().collect(),
    }
}

/// Find the lowest common ancestors of two items.
///
/// `src_y` names the second side's DAG view when the items live on
/// different perspectives; `None` walks a single shared view.
pub fn find_lcas(
    x: &Item,
    src_x: &dyn DagSource,
    y: &Item,
    src_y: Option<&dyn DagSource>,
) -> Result<Vec<Version>, LcaError> {
    let id = &x.h.id;

    // Direct parent/child on one perspective needs no walk.
    if src_y.is_none() {
        if let (Some(xv), Some(yv)) = (&x.h.v, &y.h.v) {
            if xv == yv {
                return Ok(vec![xv.clone()]);
            }
            if x.h.pa.len() == 1 && &x.h.pa[0] == yv {
                return Ok(vec![yv.clone()]);
            }
            if y.h.pa.len() == 1 && &y.h.pa[0] == xv {
                return Ok(vec![xv.clone()]);
            }
        }
    }

    let mut walk = Walk::new(x, y);

    match src_y {
        None => {
            let stream = src_x.iter_id_reverse(id)?;
            for item in &stream {
                if walk.finished() {
                    break;
                }
                walk.visit(item, true, true);
            }
            let _ = walk.finished();
        }
        Some(src_y) => {
            let vx = src_x.iter_id_reverse(id)?;
            let vy = src_y.iter_id_reverse(id)?;
            let (mut ix, mut iy) = (0usize, 0usize);
            loop {
                if walk.finished() {
                    break;
                }
                let take_x = match (vx.get(ix), vy.get(iy)) {
                    (Some(a), Some(b)) => {
                        a.h.i.unwrap_or_default() >= b.h.i.unwrap_or_default()
                    }
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => break,
                };
                if take_x {
                    walk.visit(&vx[ix], true, false);
                    ix += 1;
                } else {
                    walk.visit(&vy[iy], false, true);
                    iy += 1;
                }
            }
        }
    }

    walk.into_result()
}
