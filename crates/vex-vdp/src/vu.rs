//! Vertex Unit (VU) containers: the 64-word program binary, the constant
//! bank, and the per-vertex input layout.
//!
//! The VDP transports VU programs and layouts to the backend; it does not
//! execute them. The 32-bit instruction word layout is part of the guest ABI
//! and must round-trip exactly:
//!
//! ```text
//! bits  0..4   opcode
//! bits  4..8   destination register (0-15)
//! bits  8..12  source register (0-15)
//! bits 12..20  per-component shuffle selectors, 2 bits each (x, y, z, w)
//! bits 20..24  write mask, one bit per output component
//! ```

/// Number of 32-bit instruction words in a VU program.
pub const VU_PROGRAM_WORDS: usize = 64;

/// Number of vec4 slots in the VU constant bank.
pub const VU_CONSTANT_SLOTS: usize = 16;

/// Number of configurable vertex layout slots.
pub const VU_LAYOUT_SLOTS: usize = 8;

/// VU opcodes. Execution semantics live in the backend's vertex stage; the
/// core only encodes and transports them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VuOpcode {
    Nop = 0,
    Mov,
    Add,
    Sub,
    Mul,
    Madd,
    Min,
    Max,
    Rcp,
    Rsq,
    Dot3,
    Dot4,
    Mtx4,
    Frc,
    Flr,
    End,
}

impl VuOpcode {
    /// Total decode of the low 4 bits of an instruction word.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xF {
            0 => VuOpcode::Nop,
            1 => VuOpcode::Mov,
            2 => VuOpcode::Add,
            3 => VuOpcode::Sub,
            4 => VuOpcode::Mul,
            5 => VuOpcode::Madd,
            6 => VuOpcode::Min,
            7 => VuOpcode::Max,
            8 => VuOpcode::Rcp,
            9 => VuOpcode::Rsq,
            10 => VuOpcode::Dot3,
            11 => VuOpcode::Dot4,
            12 => VuOpcode::Mtx4,
            13 => VuOpcode::Frc,
            14 => VuOpcode::Flr,
            _ => VuOpcode::End,
        }
    }
}

/// One decoded VU instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VuInstruction {
    pub opcode: VuOpcode,
    /// Destination register, 0-15.
    pub dst: u8,
    /// Source register, 0-15.
    pub src: u8,
    /// Component selectors for x/y/z/w, each 0-3 picking a source component.
    pub shuffle: [u8; 4],
    /// 4-bit write mask, bit N enables output component N.
    pub mask: u8,
}

impl VuInstruction {
    pub fn encode(&self) -> u32 {
        let mut word = self.opcode as u32;
        word |= u32::from(self.dst & 0xF) << 4;
        word |= u32::from(self.src & 0xF) << 8;
        for (i, sel) in self.shuffle.iter().enumerate() {
            word |= u32::from(sel & 0x3) << (12 + i * 2);
        }
        word |= u32::from(self.mask & 0xF) << 20;
        word
    }

    pub fn decode(word: u32) -> Self {
        Self {
            opcode: VuOpcode::from_bits(word as u8),
            dst: ((word >> 4) & 0xF) as u8,
            src: ((word >> 8) & 0xF) as u8,
            shuffle: [
                ((word >> 12) & 0x3) as u8,
                ((word >> 14) & 0x3) as u8,
                ((word >> 16) & 0x3) as u8,
                ((word >> 18) & 0x3) as u8,
            ],
            mask: ((word >> 20) & 0xF) as u8,
        }
    }
}

/// A complete VU program: exactly [`VU_PROGRAM_WORDS`] little-endian words.
///
/// Pending programs are one-shot: attached to the next draw command only,
/// then cleared by the flush step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VuProgram(pub [u32; VU_PROGRAM_WORDS]);

impl VuProgram {
    pub const SIZE_BYTES: usize = VU_PROGRAM_WORDS * 4;

    /// Serializes the program for the storage-buffer upload. Words are
    /// little-endian regardless of host endianness.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut out = [0u8; Self::SIZE_BYTES];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE_BYTES]) -> Self {
        let mut words = [0u32; VU_PROGRAM_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self(words)
    }
}

impl Default for VuProgram {
    fn default() -> Self {
        Self([0u32; VU_PROGRAM_WORDS])
    }
}

/// The 16-slot vec4 constant bank. Persists across frames; each draw command
/// captures a full snapshot by value, so later mutations never affect
/// already-queued draws.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct VuConstantBank {
    regs: [[f32; 4]; VU_CONSTANT_SLOTS],
}

impl VuConstantBank {
    pub fn set(&mut self, slot: usize, value: [f32; 4]) -> bool {
        match self.regs.get_mut(slot) {
            Some(reg) => {
                *reg = value;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, slot: usize) -> Option<[f32; 4]> {
        self.regs.get(slot).copied()
    }

    /// Byte view suitable for a vertex-stage uniform push.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.regs)
    }
}

/// Per-vertex element formats for the VU layout slots. `Disabled` marks an
/// unused slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum VuElementFormat {
    #[default]
    Disabled,
    Float1,
    Float2,
    Float3,
    Float4,
    Short2,
    Short4,
    UByte4Norm,
}

impl VuElementFormat {
    pub fn byte_width(self) -> u32 {
        match self {
            VuElementFormat::Disabled => 0,
            VuElementFormat::Float1 => 4,
            VuElementFormat::Float2 => 8,
            VuElementFormat::Float3 => 12,
            VuElementFormat::Float4 => 16,
            VuElementFormat::Short2 => 4,
            VuElementFormat::Short4 => 8,
            VuElementFormat::UByte4Norm => 4,
        }
    }
}

/// One VU layout slot: a byte offset into the vertex and an element format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct VuLayoutSlot {
    pub offset: u32,
    pub format: VuElementFormat,
}

/// The 8-slot vertex input layout. Part of [`crate::state::RenderState`] and
/// of the pipeline cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VuLayout {
    pub slots: [VuLayoutSlot; VU_LAYOUT_SLOTS],
}

impl VuLayout {
    /// Stride matching the default layout (slot 0 = Float4 position).
    pub const DEFAULT_STRIDE: u32 = 16;

    /// Enabled slots as `(slot_index, offset, format)`.
    pub fn enabled(&self) -> impl Iterator<Item = (u32, u32, VuElementFormat)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.format != VuElementFormat::Disabled)
            .map(|(i, s)| (i as u32, s.offset, s.format))
    }
}

impl Default for VuLayout {
    fn default() -> Self {
        let mut slots = [VuLayoutSlot::default(); VU_LAYOUT_SLOTS];
        slots[0] = VuLayoutSlot {
            offset: 0,
            format: VuElementFormat::Float4,
        };
        Self { slots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_round_trips_every_field() {
        let instr = VuInstruction {
            opcode: VuOpcode::Madd,
            dst: 13,
            src: 7,
            shuffle: [3, 0, 2, 1],
            mask: 0b1010,
        };
        let word = instr.encode();
        assert_eq!(VuInstruction::decode(word), instr);

        // Exhaustive over opcode and mask; spot-check the rest.
        for op_bits in 0..16u8 {
            for mask in 0..16u8 {
                let instr = VuInstruction {
                    opcode: VuOpcode::from_bits(op_bits),
                    dst: 15 - op_bits,
                    src: op_bits,
                    shuffle: [op_bits & 3, (op_bits >> 1) & 3, mask & 3, (mask >> 2) & 3],
                    mask,
                };
                assert_eq!(VuInstruction::decode(instr.encode()), instr);
            }
        }
    }

    #[test]
    fn instruction_fields_land_in_documented_bits() {
        let word = VuInstruction {
            opcode: VuOpcode::Mov,
            dst: 0xF,
            src: 0,
            shuffle: [0, 0, 0, 0],
            mask: 0,
        }
        .encode();
        assert_eq!(word, 0x0000_00F1);

        let word = VuInstruction {
            opcode: VuOpcode::Nop,
            dst: 0,
            src: 0,
            shuffle: [0, 0, 0, 3],
            mask: 0xF,
        }
        .encode();
        assert_eq!(word, 0x00F0_0000 | (3 << 18));
    }

    #[test]
    fn program_bytes_are_little_endian() {
        let mut program = VuProgram::default();
        program.0[0] = 0x1122_3344;
        program.0[63] = 0xAABB_CCDD;
        let bytes = program.to_bytes();
        assert_eq!(&bytes[0..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[252..256], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(VuProgram::from_bytes(&bytes), program);
    }

    #[test]
    fn constant_bank_rejects_out_of_range_slots() {
        let mut bank = VuConstantBank::default();
        assert!(bank.set(15, [1.0, 2.0, 3.0, 4.0]));
        assert!(!bank.set(16, [0.0; 4]));
        assert_eq!(bank.get(15), Some([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(bank.as_bytes().len(), 256);
    }
}
