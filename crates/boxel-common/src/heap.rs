// heap.rs — max-heap primitives
//
// A heap here is a plain slice (or Vec) kept in max-heap order induced by
// an arbitrary comparator; the maximum element is always at index 0. The
// comparator need not induce a total order: with equal elements an
// arbitrary maximum ends up in front, and since both sifts move elements
// only on strict inequality, equal elements never pass each other.

use std::cmp::Ordering;

fn sift_up<T, F>(heap: &mut [T], mut i: usize, cmp: &F)
where
    F: Fn(&T, &T) -> Ordering,
{
    while i > 0 {
        let parent = (i - 1) / 2;
        if cmp(&heap[i], &heap[parent]) != Ordering::Greater {
            break;
        }
        heap.swap(i, parent);
        i = parent;
    }
}

fn sift_down<T, F>(heap: &mut [T], mut i: usize, cmp: &F)
where
    F: Fn(&T, &T) -> Ordering,
{
    let n = heap.len();
    loop {
        let left = 2 * i + 1;
        let right = left + 1;
        let mut largest = i;

        // Ties go to the left child.
        if left < n && cmp(&heap[left], &heap[largest]) == Ordering::Greater {
            largest = left;
        }
        if right < n && cmp(&heap[right], &heap[largest]) == Ordering::Greater {
            largest = right;
        }
        if largest == i {
            break;
        }
        heap.swap(i, largest);
        i = largest;
    }
}

/// Adds an element to a heap, keeping max-heap order.
pub fn heap_push<T, F>(heap: &mut Vec<T>, elem: T, cmp: &F)
where
    F: Fn(&T, &T) -> Ordering,
{
    heap.push(elem);
    let last = heap.len() - 1;
    sift_up(heap, last, cmp);
}

/// Removes and returns the maximum element, or `None` if the heap is
/// empty. The last element becomes the sift-down candidate.
pub fn heap_pop<T, F>(heap: &mut Vec<T>, cmp: &F) -> Option<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    let last = heap.pop()?;
    if heap.is_empty() {
        return Some(last);
    }
    let top = std::mem::replace(&mut heap[0], last);
    sift_down(heap, 0, cmp);
    Some(top)
}

/// Reorders an arbitrary slice into max-heap order.
pub fn heap_create<T, F>(heap: &mut [T], cmp: &F)
where
    F: Fn(&T, &T) -> Ordering,
{
    for i in 1..heap.len() {
        sift_up(heap, i, cmp);
    }
}

/// Sorts a slice into ascending order under `cmp` by heapifying it and
/// repeatedly moving the maximum to the end.
pub fn heap_sort<T, F>(heap: &mut [T], cmp: &F)
where
    F: Fn(&T, &T) -> Ordering,
{
    heap_create(heap, cmp);
    for end in (1..heap.len()).rev() {
        heap.swap(0, end);
        sift_down(&mut heap[..end], 0, cmp);
    }
}
