use super::packet::{Packet, QueueKind};

// PACKET QUEUE
//
// This module defines the three-list lifecycle queue the engine works on.
// Packets enter as YOUNG, may be parked on KEEP while hop distance is
// probed, and leave through SEND. The lists live in one slab of owned
// slots addressed by generation-checked handles, giving O(1) append,
// unlink, and splice before/after a pivot without raw pointers.
//
//   Handle - stable identifier of an enqueued packet
//   PacketQueue - owns every enqueued packet
//   insert(Box<Packet>, QueueKind) -> Handle - append at list tail
//   insert_before(Box<Packet>, Handle) -> Handle - splice ahead of a pivot
//   insert_after(Box<Packet>, Handle) -> Handle - splice behind a pivot
//   remove(Handle) -> Box<Packet> - unlink and yield ownership
//   select(QueueKind) / get() -> Option<Handle> - sweep cursor; the cursor
//     advances before the caller mutates, so removing the returned element
//     or splicing around it never derails the sweep
//   packet(Handle) / packet_mut(Handle) - access an enqueued packet
//   len() / is_empty() - total packets across all lists

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handle { slot: u32, gen: u32 }

struct Slot {
    gen: u32,
    prev: Option<Handle>,
    next: Option<Handle>,
    pkt: Option<Box<Packet>>,
}

#[derive(Clone, Copy, Default)]
struct Ends { head: Option<Handle>, tail: Option<Handle> }

pub struct PacketQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    ends: [Ends; 3],
    count: usize,
    cursor: Option<Handle>,
}

fn list_index(q: QueueKind) -> usize {
    match q {
        QueueKind::Young => 0,
        QueueKind::Keep => 1,
        QueueKind::Send => 2,
        QueueKind::Unassigned => panic!("BUG[queue]: no list for unassigned"),
    }
}

impl PacketQueue {

    pub fn new() -> PacketQueue {
        PacketQueue {
            slots: Vec::new(),
            free: Vec::new(),
            ends: [Ends::default(); 3],
            count: 0,
            cursor: None,
        }
    }

    pub fn len(&self) -> usize { self.count }

    pub fn is_empty(&self) -> bool { self.count == 0 }

    fn slot(&self, h: Handle) -> &Slot {
        let s = &self.slots[h.slot as usize];
        assert!(s.gen == h.gen && s.pkt.is_some(), "BUG[queue]: stale handle");
        s
    }

    fn slot_mut(&mut self, h: Handle) -> &mut Slot {
        let s = &mut self.slots[h.slot as usize];
        assert!(s.gen == h.gen && s.pkt.is_some(), "BUG[queue]: stale handle");
        s
    }

    pub fn packet(&self, h: Handle) -> &Packet {
        self.slot(h).pkt.as_ref().unwrap()
    }

    pub fn packet_mut(&mut self, h: Handle) -> &mut Packet {
        self.slot_mut(h).pkt.as_mut().unwrap()
    }

    fn alloc(&mut self, mut pkt: Box<Packet>, q: QueueKind) -> Handle {
        pkt.queue = q;
        match self.free.pop() {
            Some(i) => {
                let s = &mut self.slots[i as usize];
                s.prev = None;
                s.next = None;
                s.pkt = Some(pkt);
                self.count += 1;
                Handle { slot: i, gen: s.gen }
            }
            None => {
                self.slots.push(Slot { gen: 0, prev: None, next: None, pkt: Some(pkt) });
                self.count += 1;
                Handle { slot: (self.slots.len() - 1) as u32, gen: 0 }
            }
        }
    }

    pub fn insert(&mut self, pkt: Box<Packet>, q: QueueKind) -> Handle {
        let h = self.alloc(pkt, q);
        let ends = &mut self.ends[list_index(q)];
        match ends.tail {
            Some(tail) => {
                self.slots[tail.slot as usize].next = Some(h);
                self.slots[h.slot as usize].prev = Some(tail);
                ends.tail = Some(h);
            }
            None => {
                ends.head = Some(h);
                ends.tail = Some(h);
            }
        }
        h
    }

    // Splice ahead of the pivot; the new packet joins the pivot's list.
    pub fn insert_before(&mut self, pkt: Box<Packet>, pivot: Handle) -> Handle {
        let q = self.packet(pivot).queue;
        let h = self.alloc(pkt, q);
        let prev = self.slot(pivot).prev;
        self.slots[h.slot as usize].prev = prev;
        self.slots[h.slot as usize].next = Some(pivot);
        self.slots[pivot.slot as usize].prev = Some(h);
        match prev {
            Some(p) => self.slots[p.slot as usize].next = Some(h),
            None => self.ends[list_index(q)].head = Some(h),
        }
        h
    }

    // Splice behind the pivot; the new packet joins the pivot's list.
    pub fn insert_after(&mut self, pkt: Box<Packet>, pivot: Handle) -> Handle {
        let q = self.packet(pivot).queue;
        let h = self.alloc(pkt, q);
        let next = self.slot(pivot).next;
        self.slots[h.slot as usize].prev = Some(pivot);
        self.slots[h.slot as usize].next = next;
        self.slots[pivot.slot as usize].next = Some(h);
        match next {
            Some(n) => self.slots[n.slot as usize].prev = Some(h),
            None => self.ends[list_index(q)].tail = Some(h),
        }
        h
    }

    // Unlink and yield ownership. Does not destroy: cross-list moves are
    // remove + insert.
    pub fn remove(&mut self, h: Handle) -> Box<Packet> {
        if self.cursor == Some(h) {
            self.cursor = self.slot(h).next;
        }
        let (prev, next) = {
            let s = self.slot(h);
            (s.prev, s.next)
        };
        let q = self.packet(h).queue;
        let ends = &mut self.ends[list_index(q)];
        match prev {
            Some(p) => self.slots[p.slot as usize].next = next,
            None => ends.head = next,
        }
        match next {
            Some(n) => self.slots[n.slot as usize].prev = prev,
            None => ends.tail = prev,
        }
        let s = &mut self.slots[h.slot as usize];
        let mut pkt = s.pkt.take().unwrap();
        s.gen = s.gen.wrapping_add(1);
        self.free.push(h.slot);
        self.count -= 1;
        pkt.queue = QueueKind::Unassigned;
        pkt
    }

    pub fn select(&mut self, q: QueueKind) {
        self.cursor = self.ends[list_index(q)].head;
    }

    pub fn get(&mut self) -> Option<Handle> {
        let h = self.cursor?;
        self.cursor = self.slot(h).next;
        Some(h)
    }
}
