//! Energy packets.
//!
//! A packet is a plain-old-data struct tagged with its kind, so the
//! transport loop dispatches on a plain enum and the whole ensemble can be
//! checkpointed as a field-wise binary image.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::constant::H;
use crate::decay::Radionuclide;
use crate::grid::Cross;
use crate::maths;

/// Tolerance of the Doppler consistency invariant
/// |e_rf nu_cmf - e_cmf nu_rf| <= tol * e_rf * nu_cmf.
pub const DOPPLER_CONSISTENCY_TOL: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PacketKind {
    /// radioactive pellet waiting for its decay time; positron pellets
    /// deposit their energy in place of emitting a gamma
    Pellet { nuclide: Radionuclide, positron: bool },
    Gamma,
    /// non-thermal electron, deposited through the Spencer-Fano channels
    NtElectron,
    /// thermal reservoir packet
    KPacket,
    /// optical/UV/IR photon packet
    RPacket,
    /// left the grid; `escape_type` and `escape_time` record how and when
    Escaped,
    /// flagged by a per-packet invariant violation and no longer propagated
    Dead,
}

impl PacketKind {
    fn code(self) -> (u8, u8, u8) {
        match self {
            PacketKind::Pellet { nuclide, positron } => {
                (0, nuclide.index() as u8, positron as u8)
            }
            PacketKind::Gamma => (1, 0, 0),
            PacketKind::NtElectron => (2, 0, 0),
            PacketKind::KPacket => (3, 0, 0),
            PacketKind::RPacket => (4, 0, 0),
            PacketKind::Escaped => (5, 0, 0),
            PacketKind::Dead => (6, 0, 0),
        }
    }

    fn from_code(kind: u8, sub: u8, flag: u8) -> PacketKind {
        match kind {
            0 => PacketKind::Pellet {
                nuclide: Radionuclide::from_index(sub as usize),
                positron: flag != 0,
            },
            1 => PacketKind::Gamma,
            2 => PacketKind::NtElectron,
            3 => PacketKind::KPacket,
            4 => PacketKind::RPacket,
            5 => PacketKind::Escaped,
            _ => PacketKind::Dead,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// stable packet id, for debugging and deterministic replay
    pub number: u32,
    pub kind: PacketKind,
    /// position in the rest frame [cm]
    pub pos: Vector3<f64>,
    /// direction of propagation, always a unit vector
    pub dir: Vector3<f64>,
    /// current propagation cell
    pub cellindex: u32,
    /// boundary crossed last, to suppress re-crossing from rounding error
    pub last_cross: Cross,
    /// current time along the packet trajectory [s]
    pub prop_time: f64,
    /// time at which the pellet decays [s]
    pub tdecay: f64,
    /// energy in the comoving frame [erg]
    pub e_cmf: f64,
    /// energy in the rest frame [erg]
    pub e_rf: f64,
    /// frequency in the comoving frame [Hz]
    pub nu_cmf: f64,
    /// frequency in the rest frame [Hz]
    pub nu_rf: f64,
    /// packet kind it escaped as (kind code)
    pub escape_type: u8,
    pub escape_time: f64,
    /// forward hint into the sorted line list
    pub next_trans: u32,
    pub interactions: u32,
    pub nscatterings: u32,
    /// line index, -1-continuum, or the free-free sentinel
    pub emissiontype: i32,
    pub em_pos: Vector3<f64>,
    pub em_time: f64,
    pub absorptiontype: i32,
    pub absorptionfreq: f64,
    pub absorptiondir: Vector3<f64>,
    /// optional polarisation payload
    pub stokes_qu: [f64; 2],
    pub pol_dir: Vector3<f64>,
}

impl Packet {
    pub fn placeholder(number: u32) -> Packet {
        Packet {
            number,
            kind: PacketKind::Dead,
            pos: Vector3::new(0., 0., 0.),
            dir: Vector3::new(0., 0., 1.),
            cellindex: 0,
            last_cross: Cross::None,
            prop_time: 0.,
            tdecay: 0.,
            e_cmf: 0.,
            e_rf: 0.,
            nu_cmf: 0.,
            nu_rf: 0.,
            escape_type: 0,
            escape_time: 0.,
            next_trans: 0,
            interactions: 0,
            nscatterings: 0,
            emissiontype: crate::atomic::EMISSION_NONE,
            em_pos: Vector3::new(0., 0., 0.),
            em_time: 0.,
            absorptiontype: crate::atomic::EMISSION_NONE,
            absorptionfreq: 0.,
            absorptiondir: Vector3::new(0., 0., 1.),
            stokes_qu: [0., 0.],
            pol_dir: Vector3::new(0., 0., 1.),
        }
    }

    /// Is this packet still being propagated?
    pub fn is_active(&self) -> bool {
        !matches!(self.kind, PacketKind::Escaped | PacketKind::Dead)
    }

    /// Per-packet invariants: unit direction, positive rest-frame
    /// frequency for radiative kinds, Doppler-consistent energies, finite
    /// position. A violation is fatal for this packet only.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !self.pos[0].is_finite() || !self.pos[1].is_finite() || !self.pos[2].is_finite() {
            return Err(format!("packet {}: non-finite position", self.number));
        }
        if !maths::is_unit_direction(&self.dir) {
            return Err(format!(
                "packet {}: |dir| = {} is not a unit vector",
                self.number,
                self.dir.norm()
            ));
        }
        match self.kind {
            PacketKind::Gamma | PacketKind::RPacket => {
                if !(self.nu_rf > 0.) {
                    return Err(format!(
                        "packet {}: non-positive rest-frame frequency {}",
                        self.number, self.nu_rf
                    ));
                }
                let lhs = (self.e_rf * self.nu_cmf - self.e_cmf * self.nu_rf).abs();
                if lhs > DOPPLER_CONSISTENCY_TOL * self.e_rf * self.nu_cmf {
                    return Err(format!(
                        "packet {}: Doppler-inconsistent energies (e_rf {:e} e_cmf {:e} nu_rf {:e} nu_cmf {:e})",
                        self.number, self.e_rf, self.e_cmf, self.nu_rf, self.nu_cmf
                    ));
                }
            }
            _ => {}
        }
        if self.e_cmf < 0. || !self.e_cmf.is_finite() {
            return Err(format!(
                "packet {}: bad comoving energy {}",
                self.number, self.e_cmf
            ));
        }
        Ok(())
    }

    /// Set the rest-frame quantities from the comoving ones for the current
    /// direction and position (first-order Doppler).
    pub fn update_rest_frame(&mut self) {
        let vel = maths::velocity(&self.pos, self.prop_time);
        let dopplerfactor = maths::doppler(&self.dir, &vel);
        self.nu_rf = self.nu_cmf / dopplerfactor;
        self.e_rf = self.e_cmf / dopplerfactor;
    }

    /// Mean gamma-ray frequency for a pellet of the given nuclide. The
    /// gamma line catalogue is an external collaborator; its per-line
    /// sampling is folded into one effective line per nuclide here.
    pub fn gamma_frequency(nuclide: Radionuclide) -> f64 {
        nuclide.endecay_gamma() / H
    }

    fn write_binary<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(self.number)?;
        let (kind, sub, flag) = self.kind.code();
        w.write_u8(kind)?;
        w.write_u8(sub)?;
        w.write_u8(flag)?;
        for i in 0..3 {
            w.write_f64::<LittleEndian>(self.pos[i])?;
        }
        for i in 0..3 {
            w.write_f64::<LittleEndian>(self.dir[i])?;
        }
        w.write_u32::<LittleEndian>(self.cellindex)?;
        w.write_u8(self.last_cross.to_u8())?;
        w.write_f64::<LittleEndian>(self.prop_time)?;
        w.write_f64::<LittleEndian>(self.tdecay)?;
        w.write_f64::<LittleEndian>(self.e_cmf)?;
        w.write_f64::<LittleEndian>(self.e_rf)?;
        w.write_f64::<LittleEndian>(self.nu_cmf)?;
        w.write_f64::<LittleEndian>(self.nu_rf)?;
        w.write_u8(self.escape_type)?;
        w.write_f64::<LittleEndian>(self.escape_time)?;
        w.write_u32::<LittleEndian>(self.next_trans)?;
        w.write_u32::<LittleEndian>(self.interactions)?;
        w.write_u32::<LittleEndian>(self.nscatterings)?;
        w.write_i32::<LittleEndian>(self.emissiontype)?;
        for i in 0..3 {
            w.write_f64::<LittleEndian>(self.em_pos[i])?;
        }
        w.write_f64::<LittleEndian>(self.em_time)?;
        w.write_i32::<LittleEndian>(self.absorptiontype)?;
        w.write_f64::<LittleEndian>(self.absorptionfreq)?;
        for i in 0..3 {
            w.write_f64::<LittleEndian>(self.absorptiondir[i])?;
        }
        w.write_f64::<LittleEndian>(self.stokes_qu[0])?;
        w.write_f64::<LittleEndian>(self.stokes_qu[1])?;
        for i in 0..3 {
            w.write_f64::<LittleEndian>(self.pol_dir[i])?;
        }
        Ok(())
    }

    fn read_binary<R: std::io::Read>(r: &mut R) -> std::io::Result<Packet> {
        let number = r.read_u32::<LittleEndian>()?;
        let kind_code = r.read_u8()?;
        let sub = r.read_u8()?;
        let flag = r.read_u8()?;
        let mut pkt = Packet::placeholder(number);
        pkt.kind = PacketKind::from_code(kind_code, sub, flag);
        for i in 0..3 {
            pkt.pos[i] = r.read_f64::<LittleEndian>()?;
        }
        for i in 0..3 {
            pkt.dir[i] = r.read_f64::<LittleEndian>()?;
        }
        pkt.cellindex = r.read_u32::<LittleEndian>()?;
        pkt.last_cross = Cross::from_u8(r.read_u8()?);
        pkt.prop_time = r.read_f64::<LittleEndian>()?;
        pkt.tdecay = r.read_f64::<LittleEndian>()?;
        pkt.e_cmf = r.read_f64::<LittleEndian>()?;
        pkt.e_rf = r.read_f64::<LittleEndian>()?;
        pkt.nu_cmf = r.read_f64::<LittleEndian>()?;
        pkt.nu_rf = r.read_f64::<LittleEndian>()?;
        pkt.escape_type = r.read_u8()?;
        pkt.escape_time = r.read_f64::<LittleEndian>()?;
        pkt.next_trans = r.read_u32::<LittleEndian>()?;
        pkt.interactions = r.read_u32::<LittleEndian>()?;
        pkt.nscatterings = r.read_u32::<LittleEndian>()?;
        pkt.emissiontype = r.read_i32::<LittleEndian>()?;
        for i in 0..3 {
            pkt.em_pos[i] = r.read_f64::<LittleEndian>()?;
        }
        pkt.em_time = r.read_f64::<LittleEndian>()?;
        pkt.absorptiontype = r.read_i32::<LittleEndian>()?;
        pkt.absorptionfreq = r.read_f64::<LittleEndian>()?;
        for i in 0..3 {
            pkt.absorptiondir[i] = r.read_f64::<LittleEndian>()?;
        }
        pkt.stokes_qu[0] = r.read_f64::<LittleEndian>()?;
        pkt.stokes_qu[1] = r.read_f64::<LittleEndian>()?;
        for i in 0..3 {
            pkt.pol_dir[i] = r.read_f64::<LittleEndian>()?;
        }
        Ok(pkt)
    }
}

/// Write the exact in-memory packet array as a binary checkpoint.
pub fn write_packets_binary(path: &Path, packets: &[Packet]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_u64::<LittleEndian>(packets.len() as u64)?;
    for pkt in packets {
        pkt.write_binary(&mut writer)?;
    }
    writer.flush()
}

/// Read a binary packet checkpoint back, bit-exact.
pub fn read_packets_binary(path: &Path) -> std::io::Result<Vec<Packet>> {
    let mut reader = BufReader::new(File::open(path)?);
    let n = reader.read_u64::<LittleEndian>()? as usize;
    let mut packets = Vec::with_capacity(n);
    for _ in 0..n {
        packets.push(Packet::read_binary(&mut reader)?);
    }
    Ok(packets)
}

/// Human-readable packet dump (one JSON object per line), for debugging.
pub fn write_packets_json(path: &Path, packets: &[Packet]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for pkt in packets {
        let line = serde_json::to_string(pkt)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        writeln!(writer, "{}", line)?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn sample_packet(number: u32) -> Packet {
        let mut rng = Pcg64::seed_from_u64(number as u64);
        let mut pkt = Packet::placeholder(number);
        pkt.kind = PacketKind::RPacket;
        pkt.pos = Vector3::new(1.3e14, -2.4e13, 5.5e12);
        pkt.dir = crate::maths::isotropic_direction(&mut rng);
        pkt.cellindex = 117;
        pkt.prop_time = 1.2e6;
        pkt.e_cmf = 3.7e45;
        pkt.nu_cmf = 5.2e14;
        pkt.update_rest_frame();
        pkt.next_trans = 999;
        pkt.emissiontype = -42;
        pkt
    }

    #[test]
    fn test_binary_checkpoint_round_trip() {
        let packets: Vec<Packet> = (0..64).map(sample_packet).collect();
        let path = std::env::temp_dir().join(format!("snmc_ckpt_{}.tmp", std::process::id()));
        write_packets_binary(&path, &packets).unwrap();
        let restored = read_packets_binary(&path).unwrap();
        assert_eq!(packets, restored);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_doppler_consistency_after_rest_frame_update() {
        let pkt = sample_packet(3);
        pkt.check_invariants().unwrap();
        let lhs = (pkt.e_rf * pkt.nu_cmf - pkt.e_cmf * pkt.nu_rf).abs();
        assert!(lhs <= DOPPLER_CONSISTENCY_TOL * pkt.e_rf * pkt.nu_cmf);
    }

    #[test]
    fn test_invariant_check_catches_bad_direction() {
        let mut pkt = sample_packet(4);
        pkt.dir *= 1.001;
        assert!(pkt.check_invariants().is_err());
    }

    #[test]
    fn test_json_dump_one_object_per_line() {
        let packets: Vec<Packet> = (0..5).map(sample_packet).collect();
        let path = std::env::temp_dir().join(format!("snmc_dump_{}.json", std::process::id()));
        write_packets_json(&path, &packets).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 5);
        for line in contents.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("number").is_some());
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_kind_codes_round_trip() {
        let kinds = [
            PacketKind::Pellet {
                nuclide: Radionuclide::Co56,
                positron: true,
            },
            PacketKind::Gamma,
            PacketKind::NtElectron,
            PacketKind::KPacket,
            PacketKind::RPacket,
            PacketKind::Escaped,
            PacketKind::Dead,
        ];
        for kind in &kinds {
            let (a, b, c) = kind.code();
            assert_eq!(PacketKind::from_code(a, b, c), *kind);
        }
    }
}
