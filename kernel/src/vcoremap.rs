// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Which physical core runs which vcore of a process.

use kpi::process::{MAX_CORES, MAX_VCORES};
use kpi::{CoreId, VcoreId};

use crate::error::{KError, KResult};

/// Forward (vcore -> pcore) and reverse (pcore -> vcore) maps, kept in sync.
#[derive(Clone, Debug)]
pub struct VcoreMap {
    vcore_to_pcore: [Option<CoreId>; MAX_VCORES],
    pcore_to_vcore: [Option<VcoreId>; MAX_CORES],
    num_vcores: usize,
}

impl Default for VcoreMap {
    fn default() -> Self {
        VcoreMap {
            vcore_to_pcore: [None; MAX_VCORES],
            pcore_to_vcore: [None; MAX_CORES],
            num_vcores: 0,
        }
    }
}

impl VcoreMap {
    /// Vcores that currently have a core.
    pub fn num_vcores(&self) -> usize {
        self.num_vcores
    }

    pub fn is_empty(&self) -> bool {
        self.num_vcores == 0
    }

    pub fn vcore_to_pcore(&self, vcoreid: VcoreId) -> Option<CoreId> {
        self.vcore_to_pcore.get(vcoreid).copied().flatten()
    }

    pub fn pcore_to_vcore(&self, pcore: CoreId) -> Option<VcoreId> {
        self.pcore_to_vcore.get(pcore).copied().flatten()
    }

    /// Lowest vcoreid below `limit` without a core.
    pub fn get_free_vcoreid(&self, limit: usize) -> Option<VcoreId> {
        self.vcore_to_pcore
            .iter()
            .take(limit)
            .position(|p| p.is_none())
    }

    /// Number of vcoreids below `limit` without a core.
    pub fn nr_free_vcores(&self, limit: usize) -> usize {
        self.vcore_to_pcore
            .iter()
            .take(limit)
            .filter(|p| p.is_none())
            .count()
    }

    pub fn map(&mut self, vcoreid: VcoreId, pcore: CoreId) -> KResult<()> {
        match self.vcore_to_pcore.get(vcoreid) {
            None => return Err(KError::InvalidVcore { vcoreid }),
            Some(Some(_)) => return Err(KError::InvalidVcore { vcoreid }),
            Some(None) => {}
        }
        match self.pcore_to_vcore.get(pcore) {
            None => return Err(KError::InvalidCore { core: pcore }),
            Some(Some(_)) => return Err(KError::CoreAlreadyAllocated { core: pcore }),
            Some(None) => {}
        }
        self.vcore_to_pcore[vcoreid] = Some(pcore);
        self.pcore_to_vcore[pcore] = Some(vcoreid);
        self.num_vcores += 1;
        Ok(())
    }

    /// Remove `pcore` from the map, returns the vcore it ran.
    pub fn unmap_pcore(&mut self, pcore: CoreId) -> Option<VcoreId> {
        let vcoreid = self.pcore_to_vcore.get_mut(pcore)?.take()?;
        self.vcore_to_pcore[vcoreid] = None;
        self.num_vcores -= 1;
        Some(vcoreid)
    }

    /// `(vcoreid, pcore)` of every mapped vcore, by vcoreid.
    pub fn iter_mapped(&self) -> impl Iterator<Item = (VcoreId, CoreId)> + '_ {
        self.vcore_to_pcore
            .iter()
            .enumerate()
            .filter_map(|(v, p)| p.map(|p| (v, p)))
    }

    pub fn max_vcoreid(&self) -> Option<VcoreId> {
        self.vcore_to_pcore.iter().rposition(|p| p.is_some())
    }

    /// Both directions agree and the count is right.
    pub fn check_consistency(&self) -> bool {
        let forward = self
            .iter_mapped()
            .all(|(v, p)| self.pcore_to_vcore(p) == Some(v));
        let reverse = self
            .pcore_to_vcore
            .iter()
            .enumerate()
            .filter_map(|(p, v)| v.map(|v| (p, v)))
            .all(|(p, v)| self.vcore_to_pcore(v) == Some(p));
        forward && reverse && self.iter_mapped().count() == self.num_vcores
    }
}
