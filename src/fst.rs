//! Mutable weighted automaton used as model storage.
//!
//! A [`VectorFst`] is an arena of states, each holding a vector of labeled
//! arcs and a final weight. N-gram models only ever need acceptor arcs (one
//! label per arc), input-label sorting, reachability trimming, and a binary
//! serialization; anything fancier lives in the model layer.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use zerocopy::{AsBytes, FromBytes};

use crate::symbols::SymbolTable;
use crate::weight::Weight;
use crate::{Error, Label, StateId};

#[derive(Debug, Clone, PartialEq)]
pub struct Arc<W> {
    pub ilabel: Label,
    pub weight: W,
    pub nextstate: StateId,
}

impl<W> Arc<W> {
    pub fn new(ilabel: Label, weight: W, nextstate: StateId) -> Self {
        Arc {
            ilabel,
            weight,
            nextstate,
        }
    }
}

#[derive(Debug, Clone)]
struct FstState<W> {
    arcs: Vec<Arc<W>>,
    final_weight: W,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFst<W: Weight> {
    states: Vec<FstState<W>>,
    start: Option<StateId>,
    symbols: Option<SymbolTable>,
}

impl<W: Weight> VectorFst<W> {
    pub fn new() -> Self {
        VectorFst {
            states: Vec::new(),
            start: None,
            symbols: None,
        }
    }

    pub fn add_state(&mut self) -> StateId {
        self.states.push(FstState {
            arcs: Vec::new(),
            final_weight: W::zero(),
        });
        self.states.len() - 1
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn start(&self) -> Option<StateId> {
        self.start
    }

    pub fn set_start(&mut self, state: StateId) {
        self.start = Some(state);
    }

    pub fn add_arc(&mut self, state: StateId, arc: Arc<W>) {
        self.states[state].arcs.push(arc);
    }

    pub fn arcs(&self, state: StateId) -> &[Arc<W>] {
        &self.states[state].arcs
    }

    pub fn arcs_mut(&mut self, state: StateId) -> &mut Vec<Arc<W>> {
        &mut self.states[state].arcs
    }

    pub fn num_arcs(&self, state: StateId) -> usize {
        self.states[state].arcs.len()
    }

    /// Total number of arcs over all states.
    pub fn total_arcs(&self) -> usize {
        self.states.iter().map(|s| s.arcs.len()).sum()
    }

    pub fn final_weight(&self, state: StateId) -> &W {
        &self.states[state].final_weight
    }

    pub fn set_final(&mut self, state: StateId, weight: W) {
        self.states[state].final_weight = weight;
    }

    pub fn is_final(&self, state: StateId) -> bool {
        self.states[state].final_weight != W::zero()
    }

    pub fn states(&self) -> impl Iterator<Item = StateId> {
        0..self.states.len()
    }

    pub fn symbols(&self) -> Option<&SymbolTable> {
        self.symbols.as_ref()
    }

    pub fn set_symbols(&mut self, symbols: Option<SymbolTable>) {
        self.symbols = symbols;
    }

    /// Sorts every state's arcs by input label ascending, so that the
    /// back-off label (0) comes first and `find_arc` can bisect.
    pub fn arc_sort(&mut self) {
        for state in self.states.iter_mut() {
            state.arcs.sort_by_key(|arc| arc.ilabel);
        }
    }

    /// Binary-searches the arcs of `state` for `label`. Arcs must be sorted.
    pub fn find_arc(&self, state: StateId, label: Label) -> Option<&Arc<W>> {
        let arcs = &self.states[state].arcs;
        arcs.binary_search_by_key(&label, |arc| arc.ilabel)
            .ok()
            .map(|pos| &arcs[pos])
    }

    /// Position of the arc with `label` at `state`, if present.
    pub fn find_arc_pos(&self, state: StateId, label: Label) -> Option<usize> {
        self.states[state]
            .arcs
            .binary_search_by_key(&label, |arc| arc.ilabel)
            .ok()
    }

    /// Removes states that are unreachable from the start state or cannot
    /// reach any final weight, renumbering the rest in place.
    pub fn connect(&mut self) {
        let Some(start) = self.start else {
            self.states.clear();
            return;
        };
        let n = self.states.len();
        let mut accessible = vec![false; n];
        let mut stack = vec![start];
        accessible[start] = true;
        while let Some(state) = stack.pop() {
            for arc in &self.states[state].arcs {
                if !accessible[arc.nextstate] {
                    accessible[arc.nextstate] = true;
                    stack.push(arc.nextstate);
                }
            }
        }

        let mut reverse = vec![Vec::new(); n];
        for (state, s) in self.states.iter().enumerate() {
            for arc in &s.arcs {
                reverse[arc.nextstate].push(state);
            }
        }
        let mut coaccessible = vec![false; n];
        let mut stack: Vec<StateId> = (0..n).filter(|&s| self.is_final(s)).collect();
        for &s in &stack {
            coaccessible[s] = true;
        }
        while let Some(state) = stack.pop() {
            for &prev in &reverse[state] {
                if !coaccessible[prev] {
                    coaccessible[prev] = true;
                    stack.push(prev);
                }
            }
        }

        let keep: Vec<bool> = (0..n).map(|s| accessible[s] && coaccessible[s]).collect();
        if keep.iter().all(|&k| k) {
            return;
        }
        let mut remap = vec![usize::MAX; n];
        let mut next = 0;
        for s in 0..n {
            if keep[s] {
                remap[s] = next;
                next += 1;
            }
        }
        let old = std::mem::take(&mut self.states);
        for (s, mut state) in old.into_iter().enumerate() {
            if !keep[s] {
                continue;
            }
            state.arcs.retain(|arc| keep[arc.nextstate]);
            for arc in state.arcs.iter_mut() {
                arc.nextstate = remap[arc.nextstate];
            }
            self.states.push(state);
        }
        self.start = if keep[start] { Some(remap[start]) } else { None };
    }

    /// Renumbers states by the given permutation: `perm[old]` is the new id.
    pub fn permute_states(&mut self, perm: &[StateId]) {
        assert_eq!(perm.len(), self.states.len());
        let mut new_states: Vec<Option<FstState<W>>> = vec![None; self.states.len()];
        let old = std::mem::take(&mut self.states);
        for (old_id, mut state) in old.into_iter().enumerate() {
            for arc in state.arcs.iter_mut() {
                arc.nextstate = perm[arc.nextstate];
            }
            new_states[perm[old_id]] = Some(state);
        }
        self.states = new_states.into_iter().map(Option::unwrap).collect();
        self.start = self.start.map(|s| perm[s]);
    }

    pub fn write<Wr: Write>(&self, writer: &mut Wr) -> Result<(), Error> {
        let header = FileHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
            weight_arity: W::arity(),
            num_states: self.states.len() as u64,
            start: self.start.map(|s| s as u64).unwrap_or(u64::MAX),
            flags: if self.symbols.is_some() { HAS_SYMBOLS } else { 0 },
        };
        writer.write_all(header.as_bytes())?;
        for state in &self.states {
            state.final_weight.write_to(writer)?;
            writer.write_u32::<LittleEndian>(state.arcs.len() as u32)?;
            for arc in &state.arcs {
                writer.write_u32::<LittleEndian>(arc.ilabel)?;
                writer.write_u64::<LittleEndian>(arc.nextstate as u64)?;
                arc.weight.write_to(writer)?;
            }
        }
        if let Some(symbols) = &self.symbols {
            writer.write_u64::<LittleEndian>(symbols.len() as u64)?;
            for (_, word) in symbols.iter() {
                let bytes = word.as_bytes();
                writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
                writer.write_all(bytes)?;
            }
        }
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut header_bytes = [0u8; std::mem::size_of::<FileHeader>()];
        reader.read_exact(&mut header_bytes)?;
        let header =
            FileHeader::read_from(header_bytes.as_slice()).ok_or(Error::BadFileFormat)?;
        if header.magic != MAGIC
            || header.version != FORMAT_VERSION
            || header.weight_arity != W::arity()
        {
            return Err(Error::BadFileFormat);
        }
        let mut fst = VectorFst::new();
        for _ in 0..header.num_states {
            let state = fst.add_state();
            let final_weight = W::read_from(reader)?;
            fst.set_final(state, final_weight);
            let num_arcs = reader.read_u32::<LittleEndian>()?;
            for _ in 0..num_arcs {
                let ilabel = reader.read_u32::<LittleEndian>()?;
                let nextstate = reader.read_u64::<LittleEndian>()? as usize;
                let weight = W::read_from(reader)?;
                if nextstate >= header.num_states as usize {
                    return Err(Error::BadFileFormat);
                }
                fst.add_arc(state, Arc::new(ilabel, weight, nextstate));
            }
        }
        if header.start != u64::MAX {
            let start = header.start as usize;
            if start >= fst.num_states() {
                return Err(Error::BadFileFormat);
            }
            fst.set_start(start);
        }
        if header.flags & HAS_SYMBOLS != 0 {
            let count = reader.read_u64::<LittleEndian>()?;
            let mut symbols = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = reader.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf)?;
                symbols.push(String::from_utf8(buf).map_err(|_| Error::BadFileFormat)?);
            }
            let mut table = SymbolTable::default();
            for word in &symbols {
                table.add_symbol(word);
            }
            fst.set_symbols(Some(table));
        }
        Ok(fst)
    }

    pub fn write_file(&self, path: &std::path::Path) -> Result<(), Error> {
        let mut writer = io::BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut writer)
    }

    pub fn read_file(path: &std::path::Path) -> Result<Self, Error> {
        let mut reader = io::BufReader::new(std::fs::File::open(path)?);
        Self::read(&mut reader)
    }
}

const MAGIC: [u8; 8] = *b"ngramfst";
const FORMAT_VERSION: u32 = 1;
const HAS_SYMBOLS: u64 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes)]
struct FileHeader {
    magic: [u8; 8],
    version: u32,
    weight_arity: u32,
    num_states: u64,
    start: u64,
    flags: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::weight::{HistWeight, ZERO};

    fn two_state_fst() -> VectorFst<f64> {
        let mut fst = VectorFst::new();
        let a = fst.add_state();
        let b = fst.add_state();
        fst.set_start(a);
        fst.add_arc(a, Arc::new(3, 0.5, b));
        fst.add_arc(a, Arc::new(1, 0.25, b));
        fst.set_final(b, 0.0);
        fst
    }

    #[test]
    fn arc_sort_then_find() {
        let mut fst = two_state_fst();
        fst.arc_sort();
        assert_eq!(fst.arcs(0)[0].ilabel, 1);
        assert_eq!(fst.find_arc(0, 3).map(|a| a.weight), Some(0.5));
        assert!(fst.find_arc(0, 2).is_none());
    }

    #[test]
    fn connect_drops_dead_states() {
        let mut fst = two_state_fst();
        let dead = fst.add_state(); // no final weight, no path out
        fst.add_arc(0, Arc::new(7, 1.0, dead));
        fst.connect();
        assert_eq!(fst.num_states(), 2);
        assert_eq!(fst.num_arcs(0), 2);
    }

    #[test]
    fn connect_drops_unreachable_states() {
        let mut fst = two_state_fst();
        let orphan = fst.add_state();
        fst.set_final(orphan, 0.0);
        fst.connect();
        assert_eq!(fst.num_states(), 2);
    }

    #[test]
    fn binary_round_trip() {
        let mut fst = two_state_fst();
        fst.arc_sort();
        let mut symbols = SymbolTable::new();
        symbols.add_symbol("a");
        fst.set_symbols(Some(symbols));
        let mut buf = Vec::new();
        fst.write(&mut buf).unwrap();
        let back: VectorFst<f64> = VectorFst::read(&mut buf.as_slice()).unwrap();
        assert_eq!(back.num_states(), 2);
        assert_eq!(back.start(), Some(0));
        assert_eq!(back.arcs(0), fst.arcs(0));
        assert_eq!(back.symbols().unwrap().key(1), Some("a"));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let fst = two_state_fst();
        let mut buf = Vec::new();
        fst.write(&mut buf).unwrap();
        assert!(matches!(
            VectorFst::<HistWeight>::read(&mut buf.as_slice()),
            Err(Error::BadFileFormat)
        ));
    }

    #[test]
    fn permute_states_remaps_arcs() {
        let mut fst = two_state_fst();
        fst.permute_states(&[1, 0]);
        assert_eq!(fst.start(), Some(1));
        assert_eq!(fst.arcs(1)[0].nextstate, 0);
        assert_eq!(fst.final_weight(0), &0.0);
        assert_eq!(fst.final_weight(1), &ZERO);
    }
}
