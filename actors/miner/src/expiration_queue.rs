// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryInto;

use anyhow::anyhow;
use cid::Cid;
use fil_actors_runtime::{ActorDowncast, Array};
use fvm_ipld_amt::Error as AmtError;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorNumber, SectorSize};
use num_traits::{Signed, Zero};

use super::{PowerPair, QuantSpec, SectorOnChainInfo, power_for_sectors};

/// A set of sectors associated with a given epoch of an expiration queue.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct ExpirationSet {
    /// Sectors expiring "on time" at the end of their committed life
    pub on_time_sectors: BitField,
    /// Sectors expiring "early" due to being faulty for too long
    pub early_sectors: BitField,
    /// Pledge total for the on-time sectors
    pub on_time_pledge: TokenAmount,
    /// Power that is currently active (not faulty)
    pub active_power: PowerPair,
    /// Power that is currently faulty
    pub faulty_power: PowerPair,
}

impl ExpirationSet {
    pub fn empty() -> Self {
        Default::default()
    }

    /// Adds sectors and power to the expiration set in place.
    pub fn add(
        &mut self,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        on_time_pledge: &TokenAmount,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
    ) -> anyhow::Result<()> {
        self.on_time_sectors |= on_time_sectors;
        self.early_sectors |= early_sectors;
        self.on_time_pledge += on_time_pledge;
        self.active_power += active_power;
        self.faulty_power += faulty_power;

        self.validate_state()?;
        Ok(())
    }

    /// Removes sectors and power from the expiration set in place.
    pub fn remove(
        &mut self,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        on_time_pledge: &TokenAmount,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
    ) -> anyhow::Result<()> {
        // Check for sector intersection, to catch removal of sectors not in the set.
        if !self.on_time_sectors.contains_all(on_time_sectors) {
            return Err(anyhow!(
                "removing on-time sectors {:?} not contained in {:?}",
                on_time_sectors,
                self.on_time_sectors
            ));
        }
        if !self.early_sectors.contains_all(early_sectors) {
            return Err(anyhow!(
                "removing early sectors {:?} not contained in {:?}",
                early_sectors,
                self.early_sectors
            ));
        }

        self.on_time_sectors -= on_time_sectors;
        self.early_sectors -= early_sectors;
        self.on_time_pledge -= on_time_pledge;
        self.active_power -= active_power;
        self.faulty_power -= faulty_power;

        // Check underflow.
        if self.on_time_pledge.is_negative() {
            return Err(anyhow!("expiration set pledge underflow: {:?}", self));
        }
        if self.active_power.qa.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(anyhow!("expiration set power underflow: {:?}", self));
        }

        self.validate_state()?;
        Ok(())
    }

    /// A set is empty if it has no sectors.
    /// The power and pledge are not checked, but expected to be zero.
    pub fn is_empty(&self) -> bool {
        self.on_time_sectors.is_empty() && self.early_sectors.is_empty()
    }

    /// Counts all sectors in the expiration set.
    pub fn len(&self) -> u64 {
        self.on_time_sectors.len() + self.early_sectors.len()
    }

    /// Validates a set of assertions that must hold for expiration sets.
    pub fn validate_state(&self) -> anyhow::Result<()> {
        if self.on_time_pledge.is_negative() {
            return Err(anyhow!("expiration set left with negative pledge"));
        }
        if self.active_power.raw.is_negative() || self.active_power.qa.is_negative() {
            return Err(anyhow!("expiration set left with negative active power"));
        }
        if self.faulty_power.raw.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(anyhow!("expiration set left with negative faulty power"));
        }
        Ok(())
    }
}

/// A queue of expiration sets by epoch, representing the on-time or early termination epoch for a collection of sectors.
/// Wraps an AMT[ChainEpoch]*ExpirationSet.
/// Keys in the queue are quantized (upwards), modulo some offset, to reduce the cardinality of keys.
pub struct ExpirationQueue<'db, BS> {
    pub amt: Array<'db, ExpirationSet, BS>,
    pub quant: QuantSpec,
}

/// Sectors grouped by the expiration-queue entry in which they are currently scheduled.
struct SectorEpochSet {
    epoch: ChainEpoch,
    sectors: Vec<u64>,
    power: PowerPair,
    pledge: TokenAmount,
}

impl<'db, BS: Blockstore> ExpirationQueue<'db, BS> {
    /// Loads a queue root.
    ///
    /// Epochs provided to subsequent method calls will be quantized upwards to quanta mod offsetSeed before being
    /// written to/read from queue entries.
    pub fn new(store: &'db BS, root: &Cid, quant: QuantSpec) -> Result<Self, AmtError> {
        Ok(Self { amt: Array::load(root, store)?, quant })
    }

    /// Adds a collection of sectors to their on-time target expiration entries (quantized).
    /// The sectors are assumed to be active (non-faulty).
    /// Returns the sector numbers, power, and pledge added.
    pub fn add_active_sectors(
        &mut self,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, PowerPair, TokenAmount)> {
        let mut total_power = PowerPair::zero();
        let mut total_pledge = TokenAmount::zero();
        let mut total_sectors = Vec::<BitField>::new();

        for group in group_new_sectors_by_declared_expiration(sector_size, sectors, self.quant) {
            let sector_numbers = BitField::try_from_bits(group.sectors.iter().copied())?;

            self.add(
                group.epoch,
                &sector_numbers,
                &BitField::new(),
                &group.power,
                &PowerPair::zero(),
                &group.pledge,
            )
            .map_err(|e| e.downcast_wrap("failed to record new sector expirations"))?;

            total_sectors.push(sector_numbers);
            total_power += &group.power;
            total_pledge += &group.pledge;
        }

        let sector_numbers = BitField::union(total_sectors.iter());
        Ok((sector_numbers, total_power, total_pledge))
    }

    /// Reschedules some sectors to a new (quantized) expiration epoch.
    /// The sectors being rescheduled are assumed to be not faulty, and hence are removed from and re-scheduled for
    /// on-time rather than early expiration.
    /// The sectors' power and pledge are assumed not to change, despite the new expiration.
    pub fn reschedule_expirations(
        &mut self,
        new_expiration: ChainEpoch,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<()> {
        if sectors.is_empty() {
            return Ok(());
        }

        let (sector_numbers, power, pledge) = self
            .remove_active_sectors(sectors, sector_size)
            .map_err(|e| e.downcast_wrap("failed to remove sector expirations"))?;

        self.add(
            new_expiration,
            &sector_numbers,
            &BitField::new(),
            &power,
            &PowerPair::zero(),
            &pledge,
        )
        .map_err(|e| e.downcast_wrap("failed to record new sector expirations"))?;

        Ok(())
    }

    /// Re-schedules sectors to expire at an early expiration epoch (quantized), if they wouldn't
    /// expire before then anyway.
    /// The sectors must not be currently faulty, so must be registered as expiring on-time rather than early.
    /// The pledge for the now-early sectors is removed from the queue.
    /// Returns the total power represented by the sectors.
    pub fn reschedule_as_faults(
        &mut self,
        new_expiration: ChainEpoch,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<PowerPair> {
        let mut sectors_total = Vec::new();
        let mut expiring_power = PowerPair::zero();
        let mut rescheduled_power = PowerPair::zero();

        let groups = self.find_sectors_by_expiration(sector_size, sectors)?;

        // Group sectors by their current expiration, then remove from existing queue entries according to those groups.
        let new_quantized_expiration = self.quant.quantize_up(new_expiration);
        for (group, mut expiration_set) in groups {
            if group.epoch <= new_quantized_expiration {
                // Don't reschedule sectors that are already due to expire on-time before the fault-driven expiration,
                // but do represent their power as now faulty.
                // Their pledge remains as "on-time".
                expiration_set.active_power -= &group.power;
                expiration_set.faulty_power += &group.power;
                expiring_power += &group.power;
            } else {
                // Remove sectors from on-time expiry and active power.
                let sectors_bitfield = BitField::try_from_bits(group.sectors.iter().copied())?;
                expiration_set.on_time_sectors -= &sectors_bitfield;
                expiration_set.on_time_pledge -= &group.pledge;
                expiration_set.active_power -= &group.power;

                // Accumulate the sectors and power removed.
                sectors_total.extend_from_slice(&group.sectors);
                rescheduled_power += &group.power;
            }

            self.must_update_or_delete(group.epoch, expiration_set)?;
        }

        if !sectors_total.is_empty() {
            // Add sectors to new expiration as early-expiring and faulty.
            let early_sectors = BitField::try_from_bits(sectors_total)?;
            self.add(
                new_expiration,
                &BitField::new(),
                &early_sectors,
                &PowerPair::zero(),
                &rescheduled_power,
                &TokenAmount::zero(),
            )?;
        }

        Ok(&rescheduled_power + &expiring_power)
    }

    /// Re-schedules *all* sectors to expire at an early expiration epoch, if they wouldn't expire before then anyway.
    pub fn reschedule_all_as_faults(&mut self, fault_expiration: ChainEpoch) -> anyhow::Result<()> {
        let mut rescheduled_epochs = Vec::<u64>::new();
        let mut rescheduled_sectors = BitField::new();
        let mut rescheduled_power = PowerPair::zero();

        let mut mutated_expiration_sets = Vec::<(u64, ExpirationSet)>::new();

        self.amt.for_each(|e, expiration_set| {
            let epoch: ChainEpoch = e.try_into()?;
            if epoch <= self.quant.quantize_up(fault_expiration) {
                let mut expiration_set = expiration_set.clone();

                // Regardless of whether the sectors were expiring on-time or early, all the power is now faulty.
                // Pledge is still on-time.
                let active_power =
                    std::mem::replace(&mut expiration_set.active_power, PowerPair::zero());
                expiration_set.faulty_power += &active_power;
                mutated_expiration_sets.push((e, expiration_set));
            } else {
                rescheduled_epochs.push(e);

                // This epoch is later than the fault expiration, so all sectors are re-scheduled as faulty.
                rescheduled_sectors |= &expiration_set.on_time_sectors;
                rescheduled_sectors |= &expiration_set.early_sectors;
                rescheduled_power += &expiration_set.active_power;
                rescheduled_power += &expiration_set.faulty_power;
            }

            Ok(())
        })?;

        for (epoch, expiration_set) in mutated_expiration_sets {
            let res = expiration_set.validate_state();
            self.must_update(epoch as ChainEpoch, expiration_set)?;
            res?;
        }

        // If we didn't reschedule anything, we're done.
        if rescheduled_epochs.is_empty() {
            return Ok(());
        }

        // Add rescheduled sectors to the fault expiration, as early-expiring and faulty.
        self.add(
            fault_expiration,
            &BitField::new(),
            &rescheduled_sectors,
            &PowerPair::zero(),
            &rescheduled_power,
            &TokenAmount::zero(),
        )?;

        // Trim the rescheduled epochs from the queue.
        self.amt.batch_delete(rescheduled_epochs, true)?;

        Ok(())
    }

    /// Removes sectors from any queue entries in which they appear that are earlier then their scheduled expiration epoch,
    /// and schedules them at their expected termination epoch.
    /// Pledge for the sectors is re-added as on-time.
    /// Power for the sectors is changed from faulty to active (whether rescheduled or not).
    /// Returns the newly-recovered power. Fails if any sectors are not found in the queue.
    pub fn reschedule_recovered(
        &mut self,
        sectors: Vec<SectorOnChainInfo>,
        sector_size: SectorSize,
    ) -> anyhow::Result<PowerPair> {
        let mut remaining: BTreeMap<SectorNumber, &SectorOnChainInfo> =
            sectors.iter().map(|sector| (sector.sector_number, sector)).collect();

        // Traverse the expiration queue once to find each recovering sector and remove it from early/faulty there.
        // We expect this to find all recovering sectors within the first FaultMaxAge/WPoStProvingPeriod entries
        // (i.e. 14 quantized values), but if something has gone wrong it's safer not to fail if that's not met.
        let mut sectors_rescheduled = Vec::<SectorOnChainInfo>::new();
        let mut recovered_power = PowerPair::zero();

        let mut mutated_expiration_sets = Vec::<(u64, ExpirationSet)>::new();

        self.amt.for_each_while(|e, expiration_set| {
            let mut expiration_set = expiration_set.clone();
            let mut modified = false;

            let on_time_sectors: BTreeSet<SectorNumber> =
                expiration_set.on_time_sectors.iter().collect();
            let early_sectors: BTreeSet<SectorNumber> =
                expiration_set.early_sectors.iter().collect();

            // This loop could alternatively be done by constructing bitfields and intersecting them,
            // but it's inconvenient to handle the separate pieces of state, and tracking which sector
            // numbers are recovered requires the expansion anyway.
            let mut found = Vec::new();
            for (sector_number, sector) in remaining.iter() {
                if on_time_sectors.contains(sector_number) {
                    found.push(*sector_number);
                    // If the sector expires on-time at this epoch, leave it here but change faulty power to active.
                    // The pledge is already part of the on-time pledge at this entry.
                    let power = power_for_sectors(sector_size, std::slice::from_ref(*sector));
                    expiration_set.faulty_power -= &power;
                    expiration_set.active_power += &power;
                    recovered_power += &power;
                    modified = true;
                } else if early_sectors.contains(sector_number) {
                    found.push(*sector_number);
                    // If the sector expires early at this epoch, remove it for re-scheduling.
                    // It's not part of the on-time pledge, so don't change that.
                    expiration_set.early_sectors.unset(*sector_number);
                    let power = power_for_sectors(sector_size, std::slice::from_ref(*sector));
                    expiration_set.faulty_power -= &power;
                    recovered_power += &power;
                    sectors_rescheduled.push((*sector).clone());
                    modified = true;
                }
            }
            for sector_number in found {
                remaining.remove(&sector_number);
            }

            if modified {
                mutated_expiration_sets.push((e, expiration_set));
            }

            let keep_going = !remaining.is_empty();
            Ok(keep_going)
        })?;

        for (epoch, expiration_set) in mutated_expiration_sets {
            let res = expiration_set.validate_state();
            self.must_update_or_delete(epoch as ChainEpoch, expiration_set)?;
            res?;
        }

        if !remaining.is_empty() {
            return Err(anyhow!(
                "sectors not found in expiration queue: {:?}",
                remaining.keys().collect::<Vec<_>>()
            ));
        }

        // Re-schedule the removed sectors to their target expiration.
        self.add_active_sectors(&sectors_rescheduled, sector_size)?;

        Ok(recovered_power)
    }

    /// Removes some sectors and all early expirations from the queue.
    /// The sectors may be active or faulty, and scheduled either for on-time or early termination.
    /// Returns the aggregate of removed sectors and power, and the power of any removed sectors
    /// that were marked as recovering.
    /// Fails if any sectors are not found in the queue.
    pub fn remove_sectors(
        &mut self,
        sectors: &[SectorOnChainInfo],
        faults: &BitField,
        recovering: &BitField,
        sector_size: SectorSize,
    ) -> anyhow::Result<(ExpirationSet, PowerPair)> {
        let mut remaining: BTreeSet<SectorNumber> =
            sectors.iter().map(|sector| sector.sector_number).collect();

        // Split into faulty and non-faulty. We process non-faulty sectors first
        // because they always expire on-time so we know where to find them.
        let mut non_faulty_sectors = Vec::<SectorOnChainInfo>::new();
        let mut faulty_sectors = Vec::<&SectorOnChainInfo>::new();

        for sector in sectors {
            if faults.get(sector.sector_number) {
                faulty_sectors.push(sector);
            } else {
                non_faulty_sectors.push(sector.clone());

                // remove them from "remaining", we're going to process them below.
                remaining.remove(&sector.sector_number);
            }
        }

        // Remove non-faulty sectors.
        let (removed_sector_numbers, removed_power, removed_pledge) =
            self.remove_active_sectors(&non_faulty_sectors, sector_size)?;
        let mut removed = ExpirationSet {
            on_time_sectors: removed_sector_numbers,
            on_time_pledge: removed_pledge,
            active_power: removed_power,
            ..Default::default()
        };

        // Finally, remove faulty sectors (on time or not). These sectors can only appear within
        // the first 14 days (fault max age). Given that this queue is quantized, we should be able
        // to stop traversing the queue after 14 entries.
        let mut recovering_power = PowerPair::zero();
        let mut mutated_expiration_sets = Vec::<(u64, ExpirationSet)>::new();

        self.amt.for_each_while(|e, expiration_set| {
            let mut expiration_set = expiration_set.clone();
            let mut modified = false;

            let mut found = Vec::new();
            for sector in &faulty_sectors {
                let sector_number = sector.sector_number;
                let mut in_entry = false;

                if expiration_set.on_time_sectors.get(sector_number) {
                    in_entry = true;
                    expiration_set.on_time_sectors.unset(sector_number);
                    removed.on_time_sectors.set(sector_number);
                    expiration_set.on_time_pledge -= &sector.initial_pledge;
                    removed.on_time_pledge += &sector.initial_pledge;
                } else if expiration_set.early_sectors.get(sector_number) {
                    in_entry = true;
                    expiration_set.early_sectors.unset(sector_number);
                    removed.early_sectors.set(sector_number);
                }

                if in_entry {
                    let power = power_for_sectors(sector_size, std::slice::from_ref(*sector));

                    if faults.get(sector_number) {
                        expiration_set.faulty_power -= &power;
                        removed.faulty_power += &power;
                    } else {
                        expiration_set.active_power -= &power;
                        removed.active_power += &power;
                    }

                    if recovering.get(sector_number) {
                        recovering_power += &power;
                    }

                    found.push(sector_number);
                    modified = true;
                }
            }
            for sector_number in found {
                remaining.remove(&sector_number);
            }

            if modified {
                mutated_expiration_sets.push((e, expiration_set));
            }

            let keep_going = !remaining.is_empty();
            Ok(keep_going)
        })?;

        for (epoch, expiration_set) in mutated_expiration_sets {
            let res = expiration_set.validate_state();
            self.must_update_or_delete(epoch as ChainEpoch, expiration_set)?;
            res?;
        }

        if !remaining.is_empty() {
            return Err(anyhow!(
                "sectors not found in expiration queue: {:?}",
                remaining.iter().collect::<Vec<_>>()
            ));
        }

        Ok((removed, recovering_power))
    }

    /// Removes and aggregates entries from the queue up to and including some epoch.
    pub fn pop_until(&mut self, until: ChainEpoch) -> anyhow::Result<ExpirationSet> {
        let mut on_time_sectors = BitField::new();
        let mut early_sectors = BitField::new();
        let mut active_power = PowerPair::zero();
        let mut faulty_power = PowerPair::zero();
        let mut on_time_pledge = TokenAmount::zero();
        let mut popped_keys = Vec::<u64>::new();

        self.amt.for_each_while(|i, this_value| {
            if i as ChainEpoch > until {
                return Ok(false);
            }

            popped_keys.push(i);
            on_time_sectors |= &this_value.on_time_sectors;
            early_sectors |= &this_value.early_sectors;
            active_power += &this_value.active_power;
            faulty_power += &this_value.faulty_power;
            on_time_pledge += &this_value.on_time_pledge;

            Ok(true)
        })?;

        self.amt.batch_delete(popped_keys, true)?;

        Ok(ExpirationSet { on_time_sectors, early_sectors, on_time_pledge, active_power, faulty_power })
    }

    fn add(
        &mut self,
        raw_epoch: ChainEpoch,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
        pledge: &TokenAmount,
    ) -> anyhow::Result<()> {
        let epoch = self.quant.quantize_up(raw_epoch);
        let mut expiration_set = self.may_get(epoch)?;

        expiration_set
            .add(on_time_sectors, early_sectors, pledge, active_power, faulty_power)
            .map_err(|e| anyhow!("failed to add expiration values for epoch {}: {}", epoch, e))?;

        self.must_update(epoch, expiration_set)?;
        Ok(())
    }

    /// Removes active sectors from the queue, at their scheduled (on-time) expiration epochs.
    /// Returns the aggregate sector numbers, power and pledge removed.
    fn remove_active_sectors(
        &mut self,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, PowerPair, TokenAmount)> {
        let mut removed_sector_numbers = Vec::<u64>::new();
        let mut removed_power = PowerPair::zero();
        let mut removed_pledge = TokenAmount::zero();

        // Group sectors by their expiration, then remove from existing queue entries according to those groups.
        let groups = self.find_sectors_by_expiration(sector_size, sectors)?;
        for (group, mut expiration_set) in groups {
            let sectors_bitfield = BitField::try_from_bits(group.sectors.iter().copied())?;
            expiration_set
                .remove(
                    &sectors_bitfield,
                    &BitField::new(),
                    &group.pledge,
                    &group.power,
                    &PowerPair::zero(),
                )
                .map_err(|e| {
                    anyhow!("failed to remove expiration values for queue epoch {}: {}", group.epoch, e)
                })?;
            self.must_update_or_delete(group.epoch, expiration_set)?;

            removed_sector_numbers.extend(&group.sectors);
            removed_power += &group.power;
            removed_pledge += &group.pledge;
        }

        Ok((BitField::try_from_bits(removed_sector_numbers)?, removed_power, removed_pledge))
    }

    /// Groups sectors into sets based on their Expiration field.
    /// If sectors are not found in the expiration set corresponding to their expiration field
    /// (i.e. they have been rescheduled) traverse the expiration sets to for groups where these
    /// sectors actually belong.
    /// Returns the groups in expiration order, paired with the queue entry they appear in.
    fn find_sectors_by_expiration(
        &self,
        sector_size: SectorSize,
        sectors: &[SectorOnChainInfo],
    ) -> anyhow::Result<Vec<(SectorEpochSet, ExpirationSet)>> {
        if sectors.is_empty() {
            return Ok(Vec::new());
        }

        let mut remaining: BTreeMap<SectorNumber, &SectorOnChainInfo> =
            sectors.iter().map(|sector| (sector.sector_number, sector)).collect();

        // Iterate the queue, locating the entry that holds each sector on-time.
        // A sector is usually found at its quantized declared expiration, but a rescheduled
        // sector (e.g. a replaced CC sector) may be scheduled earlier.
        let mut groups = Vec::<(SectorEpochSet, ExpirationSet)>::new();

        self.amt.for_each_while(|e, expiration_set| {
            let epoch: ChainEpoch = e.try_into()?;

            let mut group_sectors = Vec::new();
            let mut group_power = PowerPair::zero();
            let mut group_pledge = TokenAmount::zero();
            for sector_number in expiration_set.on_time_sectors.iter() {
                if let Some(sector) = remaining.remove(&sector_number) {
                    group_sectors.push(sector.sector_number);
                    group_power += &power_for_sectors(sector_size, std::slice::from_ref(sector));
                    group_pledge += &sector.initial_pledge;
                }
            }

            if !group_sectors.is_empty() {
                groups.push((
                    SectorEpochSet {
                        epoch,
                        sectors: group_sectors,
                        power: group_power,
                        pledge: group_pledge,
                    },
                    expiration_set.clone(),
                ));
            }

            Ok(!remaining.is_empty())
        })?;

        if !remaining.is_empty() {
            return Err(anyhow!(
                "sectors not found in expiration queue: {:?}",
                remaining.keys().collect::<Vec<_>>()
            ));
        }

        Ok(groups)
    }

    fn may_get(&self, key: ChainEpoch) -> anyhow::Result<ExpirationSet> {
        Ok(self
            .amt
            .get(key.try_into()?)
            .map_err(|e| e.downcast_wrap(format!("failed to lookup queue epoch {}", key)))?
            .cloned()
            .unwrap_or_default())
    }

    fn must_update(
        &mut self,
        epoch: ChainEpoch,
        expiration_set: ExpirationSet,
    ) -> anyhow::Result<()> {
        self.amt
            .set(epoch.try_into()?, expiration_set)
            .map_err(|e| e.downcast_wrap(format!("failed to set queue epoch {}", epoch)))
    }

    /// Since this might delete the node, it's not safe for use inside an iteration.
    fn must_update_or_delete(
        &mut self,
        epoch: ChainEpoch,
        expiration_set: ExpirationSet,
    ) -> anyhow::Result<()> {
        if expiration_set.is_empty() {
            self.amt
                .delete(epoch.try_into()?)
                .map_err(|e| e.downcast_wrap(format!("failed to delete queue epoch {}", epoch)))?;
        } else {
            self.amt
                .set(epoch.try_into()?, expiration_set)
                .map_err(|e| e.downcast_wrap(format!("failed to set queue epoch {}", epoch)))?;
        }

        Ok(())
    }
}

/// Groups sectors into sets based on their Expiration field.
/// If sectors are not found in the expiration set corresponding to their expiration field
/// (i.e. they have been rescheduled) traverse expiration sets to find the groups where they
/// actually belong.
fn group_new_sectors_by_declared_expiration(
    sector_size: SectorSize,
    sectors: &[SectorOnChainInfo],
    quant: QuantSpec,
) -> Vec<SectorEpochSet> {
    let mut sectors_by_expiration = BTreeMap::<ChainEpoch, Vec<&SectorOnChainInfo>>::new();

    for sector in sectors {
        let q_expiration = quant.quantize_up(sector.expiration);
        sectors_by_expiration.entry(q_expiration).or_default().push(sector);
    }

    // The result is sorted by expiration because the BTreeMap iterates in sorted order.
    sectors_by_expiration
        .into_iter()
        .map(|(expiration, epoch_sectors)| {
            let mut sector_numbers = Vec::with_capacity(epoch_sectors.len());
            let mut total_power = PowerPair::zero();
            let mut total_pledge = TokenAmount::zero();

            for sector in epoch_sectors {
                sector_numbers.push(sector.sector_number);
                total_power += &power_for_sectors(sector_size, std::slice::from_ref(sector));
                total_pledge += &sector.initial_pledge;
            }

            SectorEpochSet {
                epoch: expiration,
                sectors: sector_numbers,
                power: total_power,
                pledge: total_pledge,
            }
        })
        .collect()
}
